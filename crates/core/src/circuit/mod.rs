mod path_selection;
mod pool;
mod stream;
mod types;

pub use path_selection::{PathSelectionCriteria, PathSelectionError, PathSelector};
pub use pool::{best_circuit, compare_circuits, AppId, Application, ApplicationConfig, Pausable};
pub use stream::{reason, strip_exit_notation, DetachPolicy, Stream, StreamId, StreamStatus};
pub use types::{Circuit, CircuitId, CircuitKey, CircuitStatus};
