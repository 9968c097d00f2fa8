//! Offline and online analysis: address resolution, tree building, derived
//! reports and visualization.

pub use builder::{FileReadResult, TreeBuilder};
pub use online::{OnlineAnalyzer, OnlineOptions, OnlineReport};
pub use resolve::{AddressResolver, ResolvedFrame, UNRESOLVED_LIBRARY};
pub use stats::{analyze_balance, top_hotspots, BalanceReport, HotspotInfo, SortKey};
pub use symbols::{SymbolInfo, SymbolResolver, SymbolStrategy};
pub use traverse::{level_order, postorder, preorder};
pub use tree::{
    BuildMode, Concurrency, CountMode, PerformanceTree, TreeNode, Visit, ROOT_FUNCTION,
    ROOT_LIBRARY,
};
pub use viz::{render_pdf, write_dot, ColorScheme};
pub use watch::{file_type_of, rank_from_path, DirectoryWatcher, FileType};

mod builder;
mod online;
mod resolve;
mod stats;
mod symbols;
mod traverse;
mod tree;
mod viz;
mod watch;
