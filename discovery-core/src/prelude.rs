pub use crate::strng;
pub use crate::strng::Strng;
pub use std::collections::HashMap;
pub use std::sync::{Arc, Mutex, RwLock};
pub use std::time::{Duration, Instant};
pub use tracing::{debug, error, info, trace, warn};
