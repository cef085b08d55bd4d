//! Key schedule - per-frame key derivation.
//!
//! - [`KeySchedule`] - replaceable derivation strategy
//! - [`KeyScheduleEngine`] - validates a strategy against fixtures at startup
//!   and applies the strict/lenient policy at runtime
//! - [`FixtureTable`] - verified captures used for validation and the harness
//! - [`KeyMaterial`] - key bytes plus per-byte confidence

mod engine;
mod fixture;
mod key;
mod strategy;

pub use engine::{
    validate, EngineConfig, EngineHealth, KeyPolicy, KeyScheduleEngine, ResolvedKey,
    DEFAULT_CACHE_CAPACITY, DEFAULT_MIN_FIXTURES, DEFAULT_MIN_SEQUENCES,
};
pub use fixture::{masked_hex, parse_masked_hex, Fixture, FixtureTable};
pub use key::{
    mask_of, ByteConfidence, KeyConfidence, KeyContext, KeyMaterial, ALL_VERIFIED,
    FILLER_KEY_BYTE,
};
pub use strategy::{
    function_name, is_movement, is_targeted, FunctionTableSchedule, KeySchedule,
    ObservedKeySchedule, CLICK_NPC, MOVE, MOVE_LEGACY, NPC_DIALOG, PUT_ITEM, TAKE_ITEM,
    USE_ITEM, USE_SKILL,
};
