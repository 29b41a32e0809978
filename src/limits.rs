use crate::model::Minutes;

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;

/// Active reservations allowed on one resource for one date.
pub const MAX_RESERVATIONS_PER_DAY: usize = 1_440;

/// A reservation never outlives the day it starts on.
pub const MAX_DURATION_MINUTES: Minutes = 24 * 60;

pub const MAX_CUSTOMER_NAME_LEN: usize = 120;
pub const MAX_CONTACT_LEN: usize = 32;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_NOTES_LEN: usize = 2_000;
pub const MAX_ADDRESS_LEN: usize = 500;

/// Minor currency units per hour. Keeps every quote within `i64`.
pub const MAX_HOURLY_RATE: u64 = 1_000_000_000_000;

pub const MAX_LISTEN_CHANNELS: usize = 64;
