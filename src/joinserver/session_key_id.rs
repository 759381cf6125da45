use parking_lot::Mutex;
use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::lorawan::keys::SessionKeyId;

/// Process-wide monotonic ULID source. IDs generated within the same
/// millisecond strictly increase.
pub struct SessionKeyIdGenerator {
    inner: Mutex<ulid::Generator>,
}

impl Default for SessionKeyIdGenerator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ulid::Generator::new()),
        }
    }
}

impl SessionKeyIdGenerator {
    pub fn generate(&self) -> Result<SessionKeyId> {
        self.inner
            .lock()
            .generate_from_datetime(SystemTime::now())
            .map(SessionKeyId::from)
            .map_err(|e| Error::GenerateSessionKeyId(e.to_string()))
    }
}
