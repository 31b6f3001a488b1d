pub const DBUS_NAME_SYNC: &str = "io.spaces.Sync1";
pub const DBUS_OBJECT_PATH_SYNC: &str = "/io/spaces/Sync1";

pub const DBUS_ERROR_NOT_FOUND: &str = "io.spaces.Sync1.Error.NotFound";
pub const DBUS_ERROR_BUSY: &str = "io.spaces.Sync1.Error.Busy";
pub const DBUS_ERROR_FAILED: &str = "io.spaces.Sync1.Error.Failed";

/// Suffix of in-progress transfer files in either tree.
pub const TRANSFER_TMP_SUFFIX: &str = ".sync-tmp";
