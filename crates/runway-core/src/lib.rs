mod artifacts;
mod context;
mod runs;
mod validate;

pub use artifacts::{list_artifacts, read_binary_artifact, read_text_artifacts};
pub use context::{ActionContext, DecryptConfig, ACTION_CONTEXT_HEADER};
pub use runs::{RunEngine, INPUTS_FILE, OUTPUT_FILE, RESULT_FILE};
pub use validate::{check_output, validate_input};
