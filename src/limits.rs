/// Longest weekly series a single request may book.
pub const MAX_REPEAT_COUNT: u32 = 52;

pub const MAX_REQUESTER_LEN: usize = 64;

pub const MAX_MEMO_LEN: usize = 1024;

pub const MAX_ROOM_NAME_LEN: usize = 128;

pub const MAX_ROOMS: usize = 10_000;

pub const MAX_RESERVATIONS_PER_ROOM: usize = 100_000;

/// Widest `list` window, in days.
pub const MAX_LIST_WINDOW_DAYS: i64 = 366;
