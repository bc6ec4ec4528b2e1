pub const CHANNEL_CAPACITY: usize = 100;

pub const READ_TX_ERR: &str = "Failed to send connection to reading stage";
pub const MSG_HANDLE_TX_ERR: &str = "Failed to send message to handling stage";
pub const RES_TX_ERR: &str = "Failed to send response to responding stage";
