// Server configuration
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: &str = "3000";
pub const DEFAULT_DATA_PATH: &str = "data";
pub const DATABASE_FILE: &str = "ledger.db";

// Session configuration
pub const SESSION_NAME: &str = "ledger_session";
pub const SESSION_EXPIRY_DAYS: i64 = 30;
pub const MIN_SESSION_SECRET_LENGTH: usize = 64;

// Scheduler
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 300;
pub const SCHEDULER_TOKEN_HEADER: &str = "x-scheduler-token";

// Idempotent mutations
pub const OUTBOX_ID_HEADER: &str = "x-outbox-id";
pub const RECEIPT_TTL_DAYS: i64 = 7;
pub const MAX_OUTBOX_ID_LENGTH: usize = 128;

// Change feed paging
pub const DEFAULT_SYNC_LIMIT: u32 = 100;
pub const MAX_SYNC_LIMIT: u32 = 500;

// Client outbox retry
pub const OUTBOX_BACKOFF_BASE_SECS: i64 = 2;
pub const OUTBOX_BACKOFF_MAX_SECS: i64 = 300;

// Ledger bounds
pub const MAX_AMOUNT: i64 = 1_000_000_000_000;
pub const MAX_BALANCE: i64 = 1_000_000_000_000_000;
pub const MIN_LEDGER_YEAR: i32 = 2000;
pub const MAX_LEDGER_YEAR: i32 = 2100;

// Validation limits
pub const MAX_CATEGORY_NAME_LENGTH: usize = 100;
pub const MAX_PAYMENT_METHOD_NAME_LENGTH: usize = 100;
pub const MAX_MEMO_LENGTH: usize = 255;
pub const MAX_USERNAME_LENGTH: usize = 50;
pub const MIN_USERNAME_LENGTH: usize = 4;
pub const MIN_PASSWORD_LENGTH: usize = 6;

// Error messages
pub const ERR_DATABASE_OPERATION: &str = "Database operation failed";
pub const ERR_INTERNAL: &str = "Internal server error";
pub const ERR_UNAUTHORIZED: &str = "Not logged in";
