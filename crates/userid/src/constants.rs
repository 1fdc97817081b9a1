/// Prefix carried by every informational message of the module.
pub const LOG_PREFIX: &str = "User ID";

/// Opt-out marker scoped to ID syncing in general.
pub const OPT_OUT_ID_SYNC: &str = "_pbjs_id_optout";
/// Opt-out marker scoped to this module family.
pub const OPT_OUT_ID_MODULE: &str = "_pubcid_optout";
/// Both opt-out markers, checked in order.
pub const OPT_OUT_MARKERS: [&str; 2] = [OPT_OUT_ID_SYNC, OPT_OUT_ID_MODULE];

/// Suffix of the companion key holding a local storage entry's expiry.
pub const LOCAL_STORAGE_EXP_SUFFIX: &str = "_exp";

/// Date layout used for cookie `Expires` and local storage expiry entries.
pub const EXPIRY_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Default lifetime of a stored identity when the config omits `expires`.
pub const DEFAULT_EXPIRES_DAYS: u32 = 30;
/// Upper bound accepted for `storage.expires`.
pub const MAX_EXPIRES_DAYS: u32 = 3650;

/// Default delay before deferred submodule fetches are started.
pub const DEFAULT_SYNC_DELAY_MS: u64 = 0;
/// Upper bound for the sync delay; longer values are clamped.
pub const MAX_SYNC_DELAY_MS: u64 = 60_000;
