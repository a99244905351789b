mod import;
mod lint;
mod manifest;
mod pysource;
mod schema;

pub use import::{import_packages, ImportOptions, ImportedPackage};
pub use lint::{lint_entry_point, LintFinding};
pub use manifest::{find_manifests, PackageManifest};
pub use pysource::{scan_package_sources, EntryPoint, PyParam};
pub use schema::{build_input_schema, build_output_schema, managed_param_kind};
