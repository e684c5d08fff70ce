//! Hard limits enforced by the engine and the cart.

pub const MAX_FACILITIES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_LOCATION_LEN: usize = 200;
pub const MAX_HOLDER_LEN: usize = 256;
pub const MAX_USER_ID_LEN: usize = 256;

/// Widest window the generator will produce in one pass.
pub const MAX_GENERATION_DAYS: u32 = 366;
/// Widest window a browse query may read.
pub const MAX_BROWSE_DAYS: u32 = 62;

pub const MAX_CART_ITEMS: usize = 200;
/// Range requests accepted by a single add-to-cart call.
pub const MAX_RANGE_REQUESTS: usize = 64;
/// Slots a single hold may cover.
pub const MAX_HOLD_SLOTS: usize = MAX_CART_ITEMS;

/// Compare-and-swap attempts before a cart mutation gives up.
pub const MAX_CAS_RETRIES: usize = 16;
