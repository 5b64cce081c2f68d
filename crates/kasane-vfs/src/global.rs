//! Process-wide default composite.
//!
//! Some hosts want one ambient filesystem shared by otherwise unrelated
//! code. Rather than reaching through a hidden static, the default is
//! explicit state with documented init and teardown; components should
//! still prefer taking a [`LayeredFs`] by parameter and fall back to this
//! only at the outermost wiring layer.

use parking_lot::RwLock;

use crate::layered::LayeredFs;

static DEFAULT: RwLock<Option<LayeredFs>> = RwLock::new(None);

/// Install the process-wide default, replacing any previous one.
pub fn set_default(fs: LayeredFs) {
    *DEFAULT.write() = Some(fs);
}

/// The current default, if one was installed.
pub fn default_fs() -> Option<LayeredFs> {
    DEFAULT.read().clone()
}

/// Tear the default down. Handles already obtained keep working; only the
/// ambient lookup goes away.
pub fn clear_default() {
    *DEFAULT.write() = None;
}
