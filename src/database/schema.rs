// SQL schema for the audit ledger, applied in order by `Database::run_migrations`.

pub const AUDIT_EVENTS_SCHEMA: &str = include_str!("../../migrations/001_audit_events.sql");
pub const AUDIT_CHECKPOINTS_SCHEMA: &str =
    include_str!("../../migrations/002_audit_checkpoints.sql");
pub const SIGNING_KEYS_SCHEMA: &str = include_str!("../../migrations/003_signing_keys.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_audit_events", AUDIT_EVENTS_SCHEMA),
    ("002_audit_checkpoints", AUDIT_CHECKPOINTS_SCHEMA),
    ("003_signing_keys", SIGNING_KEYS_SCHEMA),
];
