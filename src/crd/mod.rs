//! Custom resources the operator creates but does not own the definition of

mod horizontal_pod_cronscaler;

pub use horizontal_pod_cronscaler::*;
