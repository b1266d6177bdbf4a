pub use anyhow::{Context, Result, anyhow, bail, ensure};
pub use log::{debug, error, info, trace, warn};
pub use serde::{Deserialize, Serialize};
