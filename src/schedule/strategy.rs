//! Key-schedule strategies.
//!
//! The real derivation rule is only partly known, so strategies sit behind
//! the [`KeySchedule`] trait and can be swapped without touching callers.
//!
//! - [`ObservedKeySchedule`] - layered model built from verified captures
//! - [`FunctionTableSchedule`] - one key per function code, sequence ignored

use std::collections::HashMap;

use super::fixture::FixtureTable;
use super::key::{mask_of, KeyContext, KeyMaterial, ALL_VERIFIED, FILLER_KEY_BYTE};
use crate::protocol::{Sequence, BODY_SIZE};

/// Derives the 16-byte body key for a frame.
pub trait KeySchedule: Send + Sync {
    /// Short name used in logs and reports.
    fn name(&self) -> &str;

    /// Key for a (sequence, function code) pair, or `None` if this strategy
    /// has nothing to offer for it.
    fn derive(&self, sequence: Sequence, function_code: u16, ctx: &KeyContext)
        -> Option<KeyMaterial>;

    /// Function codes worth trying when detecting a frame's message type.
    fn candidates(&self, sequence: Sequence) -> Vec<u16>;

    /// Whether [`KeySchedule::derive`] reads the [`KeyContext`]. When it does
    /// not, the engine caches one key per (sequence, function code).
    fn uses_context(&self) -> bool {
        false
    }
}

/// Movement family (the client omits the actor id, param1 is zero).
pub const MOVE_LEGACY: u16 = 0x0BC3;
pub const MOVE: u16 = 0x0BC5;
pub const USE_SKILL: u16 = 0x0BC9;
/// Targeted family (param1 carries an item or NPC id).
pub const USE_ITEM: u16 = 0x03EE;
pub const CLICK_NPC: u16 = 0x03F2;
pub const NPC_DIALOG: u16 = 0x03F3;
pub const PUT_ITEM: u16 = 0x1396;
pub const TAKE_ITEM: u16 = 0x1397;

/// Human-readable name of a known function code.
pub fn function_name(code: u16) -> Option<&'static str> {
    Some(match code {
        MOVE_LEGACY => "move (legacy coordinates)",
        MOVE => "move",
        USE_SKILL => "use skill",
        USE_ITEM => "use item",
        CLICK_NPC => "click npc",
        NPC_DIALOG => "npc dialog option",
        PUT_ITEM => "put item into dialog",
        TAKE_ITEM => "take item from dialog",
        _ => return None,
    })
}

/// Whether a function code belongs to the movement family.
pub fn is_movement(code: u16) -> bool {
    matches!(code, MOVE_LEGACY | MOVE | USE_SKILL)
}

/// Whether a function code belongs to the targeted (item/NPC) family.
pub fn is_targeted(code: u16) -> bool {
    matches!(code, USE_ITEM | CLICK_NPC | NPC_DIALOG | PUT_ITEM | TAKE_ITEM)
}

const MOVE_TEMPLATE: [u8; 16] = [
    0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0xF9, 0x37, 0x58, 0x41, 0x3D, 0x72, 0x0E, 0x3C,
];
const ITEM_TEMPLATE: [u8; 16] = [
    0x0F, 0x88, 0x7D, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0xD2, 0x3F, 0x70, 0x6A, 0x62, 0x70, 0x68, 0x3C,
];
const DIALOG_ITEM_TEMPLATE: [u8; 16] = [
    0x6A, 0x26, 0x50, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0xAA, 0x2F, 0x30, 0x52, 0x40, 0x6C, 0x74, 0x3C,
];
const CLICK_NPC_TEMPLATE: [u8; 16] = [
    0x3C, 0xC6, 0xF8, 0x77, 0x3F, 0x4C, 0x3C, 0x3C, 0xCE, 0x3F, 0x3F, 0x6E, 0x3C, 0x6C, 0x3C, 0x3C,
];
const NPC_DIALOG_TEMPLATE: [u8; 16] = [
    0x3C, 0xC6, 0xF8, 0x77, 0x3F, 0x4C, 0x3C, 0x3C, 0xCF, 0x3F, 0x3F, 0x6F, 0x3C, 0x6C, 0x3C, 0x3C,
];

/// Extension key prefixes that go with the templates above.
const ITEM_TAIL: [u8; 8] = [0x83, 0x82, 0x84, 0x89, 0xF5, 0xCD, 0xBB, 0xE7];
const DIALOG_ITEM_TAIL: [u8; 8] = [0xF2, 0xE2, 0xD4, 0x9A, 0x89, 0xF8, 0xBE, 0xDA];
const NPC_DIALOG_TAIL: [u8; 8] = [0x7C, 0xEB, 0x8C, 0x8D, 0x84, 0xF6, 0xB8, 0x99];

/// Per-function-code keys from the first capture tool. Sequence-insensitive.
const FUNCTION_TABLE: [(u16, [u8; 16]); 8] = [
    (MOVE_LEGACY, MOVE_TEMPLATE),
    (MOVE, MOVE_TEMPLATE),
    (USE_SKILL, MOVE_TEMPLATE),
    (USE_ITEM, ITEM_TEMPLATE),
    (PUT_ITEM, DIALOG_ITEM_TEMPLATE),
    (TAKE_ITEM, DIALOG_ITEM_TEMPLATE),
    (CLICK_NPC, CLICK_NPC_TEMPLATE),
    (NPC_DIALOG, NPC_DIALOG_TEMPLATE),
];

fn table_entry(function_code: u16) -> Option<&'static [u8; 16]> {
    FUNCTION_TABLE
        .iter()
        .find(|(code, _)| *code == function_code)
        .map(|(_, key)| key)
}

fn table_extension(function_code: u16) -> &'static [u8] {
    match function_code {
        USE_ITEM => &ITEM_TAIL,
        PUT_ITEM | TAKE_ITEM => &DIALOG_ITEM_TAIL,
        NPC_DIALOG => &NPC_DIALOG_TAIL,
        _ => &[],
    }
}

/// Sequence-insensitive table lookup.
///
/// Claims every byte as verified, so startup validation against captures
/// from more than one sequence exposes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionTableSchedule;

impl KeySchedule for FunctionTableSchedule {
    fn name(&self) -> &str {
        "function-table"
    }

    fn derive(&self, _sequence: Sequence, function_code: u16, _ctx: &KeyContext) -> Option<KeyMaterial> {
        table_entry(function_code).map(|key| {
            KeyMaterial::observed(*key, ALL_VERIFIED).with_extension(table_extension(function_code).to_vec())
        })
    }

    fn candidates(&self, _sequence: Sequence) -> Vec<u16> {
        FUNCTION_TABLE.iter().map(|(code, _)| *code).collect()
    }
}

/// Key bytes recovered from one verified capture.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Observation {
    bytes: [u8; BODY_SIZE],
    verified: u16,
    /// Extension key prefix recovered from known text.
    extension: Vec<u8>,
}

impl Observation {
    fn unknown() -> Self {
        Self {
            bytes: [FILLER_KEY_BYTE; BODY_SIZE],
            verified: 0,
            extension: Vec::new(),
        }
    }

    fn known(&self, position: usize) -> Option<u8> {
        (self.verified & (1 << position) != 0).then_some(self.bytes[position])
    }
}

struct BuiltinObservation {
    sequence: u8,
    function_code: u16,
    bytes: [u8; 16],
    verified: u16,
    extension: &'static [u8],
}

/// Bytes 0..14 verified; the trailing pair sits under an unparsed text field.
const FIRST_14: u16 = 0x3FFF;
const FIRST_12: u16 = 0x0FFF;

const BUILTIN_OBSERVATIONS: [BuiltinObservation; 7] = [
    BuiltinObservation {
        sequence: 4,
        function_code: MOVE,
        bytes: MOVE_TEMPLATE,
        verified: ALL_VERIFIED,
        extension: &[],
    },
    BuiltinObservation {
        sequence: 3,
        function_code: MOVE_LEGACY,
        bytes: [
            0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0xFF, 0x37, 0x02, 0x3E, 0x38, 0x6F, 0x4F, 0x3C,
        ],
        verified: ALL_VERIFIED,
        extension: &[],
    },
    BuiltinObservation {
        sequence: 4,
        function_code: USE_ITEM,
        bytes: ITEM_TEMPLATE,
        verified: FIRST_14,
        extension: &ITEM_TAIL,
    },
    BuiltinObservation {
        sequence: 1,
        function_code: USE_ITEM,
        bytes: [
            0x83, 0xD7, 0x48, 0x3C, 0x3C, 0x3C, 0x3C, 0x3C, 0xD2, 0x3F, 0x72, 0x6A, 0x5C, 0x70, 0x3C, 0x3C,
        ],
        verified: FIRST_14,
        extension: &[0xEF, 0xE4, 0x8F, 0xFA, 0xF6, 0x93],
    },
    BuiltinObservation {
        sequence: 8,
        function_code: CLICK_NPC,
        bytes: CLICK_NPC_TEMPLATE,
        verified: FIRST_12,
        extension: &[],
    },
    BuiltinObservation {
        sequence: 7,
        function_code: NPC_DIALOG,
        bytes: NPC_DIALOG_TEMPLATE,
        verified: FIRST_12,
        extension: &[
            0x7C, 0x80, 0xEF, 0xF4, 0xD7, 0xFA, 0xA3, 0x8D, 0xD0, 0x82, 0xAB, 0x7B, 0x43, 0x72, 0x5B, 0x4D, 0x5E, 0x57,
            0xDC, 0xAD, 0xED, 0xBA, 0x6F,
        ],
    },
    BuiltinObservation {
        sequence: 8,
        function_code: PUT_ITEM,
        bytes: DIALOG_ITEM_TEMPLATE,
        verified: FIRST_14,
        extension: &[
            0xF2, 0xE2, 0xD4, 0x9A, 0x89, 0xF8, 0xBE, 0xDA, 0xC2, 0xA4, 0xB0, 0xB8, 0x85, 0xEE, 0xB0, 0xB6,
        ],
    },
];

/// Layered key model built from verified captures.
///
/// For a requested pair:
/// 1. an exact (sequence, function code) observation supplies its verified
///    bytes and the key is reported verified or partial;
/// 2. otherwise the same function code observed at the cyclically nearest
///    sequence serves as a template and the key is reported inferred;
/// 3. positions nothing covers fall back to the function table entry, then
///    to the `0x3C` filler.
///
/// The rolling-counter context is not used yet.
#[derive(Debug, Clone, Default)]
pub struct ObservedKeySchedule {
    observations: HashMap<(Sequence, u16), Observation>,
}

impl ObservedKeySchedule {
    /// Schedule with no observations (only the function table remains).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Schedule seeded with every capture verified so far.
    pub fn builtin() -> Self {
        let mut schedule = Self::empty();
        for obs in &BUILTIN_OBSERVATIONS {
            if let Some(sequence) = Sequence::new(obs.sequence) {
                schedule.observations.insert(
                    (sequence, obs.function_code),
                    Observation {
                        bytes: obs.bytes,
                        verified: obs.verified,
                        extension: obs.extension.to_vec(),
                    },
                );
            }
        }
        schedule
    }

    /// Schedule learned from a fixture table.
    pub fn from_fixtures(fixtures: &FixtureTable) -> Self {
        let mut schedule = Self::empty();
        for fixture in fixtures.iter() {
            schedule = schedule
                .with_observation(fixture.sequence(), fixture.function_code(), fixture.key())
                .with_extension(fixture.sequence(), fixture.function_code(), &fixture.extension_key());
        }
        schedule
    }

    /// Add or merge an observation. Verified bytes already present win.
    pub fn with_observation(
        mut self,
        sequence: Sequence,
        function_code: u16,
        key: [Option<u8>; BODY_SIZE],
    ) -> Self {
        let entry = self
            .observations
            .entry((sequence, function_code))
            .or_insert_with(Observation::unknown);
        for (i, byte) in key.iter().enumerate() {
            if let (Some(byte), None) = (byte, entry.known(i)) {
                entry.bytes[i] = *byte;
            }
        }
        entry.verified |= mask_of(&key);
        self
    }

    /// Add extension key bytes for a pair. Bytes already known win; only
    /// the part past the current prefix is appended.
    pub fn with_extension(mut self, sequence: Sequence, function_code: u16, extension: &[u8]) -> Self {
        if extension.is_empty() {
            return self;
        }
        let entry = self
            .observations
            .entry((sequence, function_code))
            .or_insert_with(Observation::unknown);
        if extension.len() > entry.extension.len() {
            let known = entry.extension.len();
            entry.extension.extend_from_slice(&extension[known..]);
        }
        self
    }

    /// Number of observed pairs.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Check if no pair is observed.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations of `function_code` at other sequences, nearest first.
    fn neighbours(&self, sequence: Sequence, function_code: u16) -> Vec<(Sequence, &Observation)> {
        let mut found: Vec<_> = self
            .observations
            .iter()
            .filter(|((seq, code), _)| *code == function_code && *seq != sequence)
            .map(|((seq, _), obs)| (*seq, obs))
            .collect();
        found.sort_by_key(|(seq, _)| (sequence.cyclic_distance(*seq), *seq));
        found
    }

    fn fill_extension(&self, neighbours: &[(Sequence, &Observation)], function_code: u16) -> Vec<u8> {
        neighbours
            .iter()
            .map(|(_, obs)| obs.extension.as_slice())
            .find(|ext| !ext.is_empty())
            .unwrap_or_else(|| table_extension(function_code))
            .to_vec()
    }

    fn fill(&self, neighbours: &[(Sequence, &Observation)], function_code: u16, position: usize) -> u8 {
        neighbours
            .iter()
            .find_map(|(_, obs)| obs.known(position))
            .or_else(|| table_entry(function_code).map(|key| key[position]))
            .unwrap_or(FILLER_KEY_BYTE)
    }
}

impl KeySchedule for ObservedKeySchedule {
    fn name(&self) -> &str {
        "observed"
    }

    fn derive(&self, sequence: Sequence, function_code: u16, _ctx: &KeyContext) -> Option<KeyMaterial> {
        let neighbours = self.neighbours(sequence, function_code);

        if let Some(obs) = self.observations.get(&(sequence, function_code)) {
            let bytes = std::array::from_fn(|i| {
                obs.known(i)
                    .unwrap_or_else(|| self.fill(&neighbours, function_code, i))
            });
            let extension = if obs.extension.is_empty() {
                self.fill_extension(&neighbours, function_code)
            } else {
                obs.extension.clone()
            };
            return Some(KeyMaterial::observed(bytes, obs.verified).with_extension(extension));
        }

        let source = match neighbours.first() {
            Some((seq, _)) => format!("function 0x{function_code:04X} at sequence {seq}"),
            None if table_entry(function_code).is_some() => {
                format!("function table entry 0x{function_code:04X}")
            }
            None => return None,
        };
        let bytes = std::array::from_fn(|i| self.fill(&neighbours, function_code, i));
        let extension = self.fill_extension(&neighbours, function_code);
        Some(KeyMaterial::inferred(bytes, source).with_extension(extension))
    }

    fn candidates(&self, sequence: Sequence) -> Vec<u16> {
        let mut codes: Vec<u16> = self
            .observations
            .keys()
            .filter(|(seq, _)| *seq == sequence)
            .map(|(_, code)| *code)
            .collect();
        codes.sort_unstable();

        let mut rest: Vec<u16> = self
            .observations
            .keys()
            .map(|(_, code)| *code)
            .chain(FUNCTION_TABLE.iter().map(|(code, _)| *code))
            .filter(|code| !codes.contains(code))
            .collect();
        rest.sort_unstable();
        rest.dedup();

        codes.extend(rest);
        codes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::key::KeyConfidence;

    fn seq(n: u8) -> Sequence {
        Sequence::new(n).unwrap()
    }

    #[test]
    fn test_exact_observation_is_verified() {
        let schedule = ObservedKeySchedule::builtin();
        let key = schedule.derive(seq(3), MOVE_LEGACY, &KeyContext::default()).unwrap();

        assert_eq!(key.confidence(), &KeyConfidence::Verified);
        assert_eq!(key.bytes()[8..11], [0xFF, 0x37, 0x02]);
    }

    #[test]
    fn test_sequence_three_and_four_keys_differ() {
        let schedule = ObservedKeySchedule::builtin();
        let ctx = KeyContext::default();
        let three = schedule.derive(seq(3), MOVE_LEGACY, &ctx).unwrap();
        let four = schedule.derive(seq(4), MOVE, &ctx).unwrap();

        assert_eq!(three.bytes()[10], 0x02);
        assert_eq!(four.bytes()[10], 0x58);
    }

    #[test]
    fn test_partial_observation_fills_unverified_bytes() {
        let schedule = ObservedKeySchedule::builtin();
        let key = schedule.derive(seq(8), CLICK_NPC, &KeyContext::default()).unwrap();

        assert_eq!(key.confidence(), &KeyConfidence::Partial { verified: 12 });
        // Bytes 12..16 come from the function table entry.
        assert_eq!(key.bytes()[12..], [0x3C, 0x6C, 0x3C, 0x3C]);
    }

    #[test]
    fn test_unseen_sequence_borrows_nearest_observation() {
        let schedule = ObservedKeySchedule::builtin();
        let key = schedule.derive(seq(2), USE_ITEM, &KeyContext::default()).unwrap();

        assert!(key.is_inferred());
        // Sequence 1 is nearer to 2 than sequence 4.
        assert_eq!(key.bytes()[..3], [0x83, 0xD7, 0x48]);
        assert_eq!(
            key.confidence(),
            &KeyConfidence::Inferred {
                source: "function 0x03EE at sequence 1".to_string()
            }
        );
    }

    #[test]
    fn test_table_only_code_is_inferred() {
        let schedule = ObservedKeySchedule::builtin();
        let key = schedule.derive(seq(5), USE_SKILL, &KeyContext::default()).unwrap();
        assert!(key.is_inferred());
        assert_eq!(key.bytes(), &MOVE_TEMPLATE);
    }

    #[test]
    fn test_unknown_code_has_no_key() {
        let schedule = ObservedKeySchedule::builtin();
        assert!(schedule.derive(seq(5), 0x7777, &KeyContext::default()).is_none());
        assert!(FunctionTableSchedule.derive(seq(5), 0x7777, &KeyContext::default()).is_none());
    }

    #[test]
    fn test_candidates_put_observed_codes_first() {
        let schedule = ObservedKeySchedule::builtin();
        let codes = schedule.candidates(seq(8));

        assert_eq!(codes[..2], [CLICK_NPC, PUT_ITEM]);
        assert_eq!(codes.len(), FUNCTION_TABLE.len());
        assert!(codes.contains(&USE_SKILL));
    }

    #[test]
    fn test_with_observation_merges_masks() {
        let mut first = [None; 16];
        first[0] = Some(0x11);
        let mut second = [None; 16];
        second[0] = Some(0x99);
        second[1] = Some(0x22);

        let schedule = ObservedKeySchedule::empty()
            .with_observation(seq(6), 0x0100, first)
            .with_observation(seq(6), 0x0100, second);
        let key = schedule.derive(seq(6), 0x0100, &KeyContext::default()).unwrap();

        assert_eq!(key.bytes()[..3], [0x11, 0x22, FILLER_KEY_BYTE]);
        assert_eq!(key.verified_mask(), 0b11);
    }

    #[test]
    fn test_extension_keys() {
        let schedule = ObservedKeySchedule::builtin();
        let ctx = KeyContext::default();

        let potion = schedule.derive(seq(4), USE_ITEM, &ctx).unwrap();
        assert_eq!(potion.extension(), &ITEM_TAIL);

        let scroll = schedule.derive(seq(1), USE_ITEM, &ctx).unwrap();
        assert_eq!(scroll.extension(), &[0xEF, 0xE4, 0x8F, 0xFA, 0xF6, 0x93]);

        // Sequence 2 borrows from sequence 1 like the body does.
        let borrowed = schedule.derive(seq(2), USE_ITEM, &ctx).unwrap();
        assert_eq!(borrowed.extension(), scroll.extension());

        // Nothing known for movement.
        assert!(schedule.derive(seq(4), MOVE, &ctx).unwrap().extension().is_empty());
    }

    #[test]
    fn test_with_extension_keeps_known_prefix() {
        let schedule = ObservedKeySchedule::empty()
            .with_extension(seq(6), 0x0100, &[0x01, 0x02])
            .with_extension(seq(6), 0x0100, &[0x09, 0x09, 0x03]);
        let key = schedule.derive(seq(6), 0x0100, &KeyContext::default()).unwrap();
        assert_eq!(key.extension(), &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_strategies_ignore_context() {
        assert!(!ObservedKeySchedule::builtin().uses_context());
        assert!(!FunctionTableSchedule.uses_context());
    }

    #[test]
    fn test_function_table_ignores_sequence() {
        let ctx = KeyContext::default();
        let a = FunctionTableSchedule.derive(seq(1), MOVE, &ctx).unwrap();
        let b = FunctionTableSchedule.derive(seq(9), MOVE, &ctx).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.confidence(), &KeyConfidence::Verified);
    }

    #[test]
    fn test_function_names() {
        assert_eq!(function_name(MOVE), Some("move"));
        assert_eq!(function_name(0x0001), None);
        assert!(is_movement(USE_SKILL));
        assert!(is_targeted(PUT_ITEM));
        assert!(!is_targeted(MOVE));
    }
}
