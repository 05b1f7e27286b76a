mod header;
mod pattern;
mod table;

pub use header::{CompiledHeaderMatcher, HeaderMatchType};
pub use pattern::PathPattern;
pub use table::{CompiledRoute, OverlapPolicy, RouteMatch, RouteTable};
