pub mod loader;
pub mod pattern;
pub mod table;
pub mod unit;

pub use loader::{load_directory, load_error_file, merge_units, VersionDefinition};
pub use pattern::{compile_pattern, CompiledPattern};
pub use table::{EndpointRule, MappingSnapshot, ResolvedEndpoint, RuleKey, VersionTable};
pub use unit::{EndpointConfig, MappingUnit};
