//! Key schedule engine: strategy + startup validation + runtime policy.
//!
//! The engine re-derives every fixture when it is built. If any verified
//! byte disagrees the engine is poisoned: it stays constructible so callers
//! can inspect [`KeyScheduleEngine::health`], but every key request answers
//! with the recorded [`ConsistencyError`].
//!
//! # Example
//!
//! ```
//! use mirwire::protocol::Sequence;
//! use mirwire::schedule::{EngineConfig, FixtureTable, KeyContext, KeyScheduleEngine, ObservedKeySchedule};
//!
//! let fixtures = FixtureTable::builtin().unwrap();
//! let engine = KeyScheduleEngine::try_new(ObservedKeySchedule::builtin(), fixtures, EngineConfig::default()).unwrap();
//!
//! let key = engine.schedule(Sequence::new(3).unwrap(), 0x0BC3, &KeyContext::default()).unwrap();
//! assert_eq!(key.bytes()[10], 0x02);
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::fixture::FixtureTable;
use super::key::{KeyContext, KeyMaterial, FILLER_KEY_BYTE};
use super::strategy::{is_movement, is_targeted, KeySchedule};
use crate::codec::{DecodedPacket, ExtensionCodec, FieldCodec};
use crate::error::{ConsistencyError, DetectionError, Result, UnknownKeyError};
use crate::protocol::{Frame, Sequence, BODY_SIZE};

/// Minimum fixtures needed for startup validation.
pub const DEFAULT_MIN_FIXTURES: usize = 4;

/// Minimum distinct sequences among those fixtures.
pub const DEFAULT_MIN_SEQUENCES: usize = 2;

/// Cached derivations kept before entries are evicted.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// What to do with a pair no fixture confirms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Refuse with [`UnknownKeyError`].
    #[default]
    Strict,
    /// Best-effort key flagged as inferred.
    Lenient,
}

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: KeyPolicy,
    pub min_fixtures: usize,
    pub min_sequences: usize,
    /// Memoize strategy output per (sequence, function code), plus the
    /// context when the strategy reads it.
    pub cache: bool,
    /// Upper bound on cached derivations.
    pub cache_capacity: usize,
}

impl EngineConfig {
    /// Set the runtime policy.
    pub fn with_policy(mut self, policy: KeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the validation minimums.
    pub fn with_minimums(mut self, fixtures: usize, sequences: usize) -> Self {
        self.min_fixtures = fixtures;
        self.min_sequences = sequences;
        self
    }

    /// Enable or disable the key cache.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    /// Bound the key cache.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: KeyPolicy::Strict,
            min_fixtures: DEFAULT_MIN_FIXTURES,
            min_sequences: DEFAULT_MIN_SEQUENCES,
            cache: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Outcome of startup validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHealth {
    /// All fixtures reproduced.
    Ready {
        /// Fixtures checked.
        fixtures: usize,
    },
    /// Built without validation; for harness evaluation only.
    Unvalidated,
    /// Validation failed; the engine refuses all work.
    Poisoned(ConsistencyError),
}

/// Key and function code chosen for a captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub function_code: u16,
    pub key: KeyMaterial,
    /// Other codes that decode the frame just as plausibly. Only ever
    /// non-empty under [`KeyPolicy::Lenient`], and then `key` is inferred.
    pub alternatives: Vec<u16>,
}

type CacheKey = (Sequence, u16, KeyContext);

/// Validated, policy-aware front end to a [`KeySchedule`].
///
/// Safe to share across threads; derivation is pure and the cache is a
/// concurrent map.
pub struct KeyScheduleEngine {
    strategy: Arc<dyn KeySchedule>,
    fixtures: FixtureTable,
    config: EngineConfig,
    health: EngineHealth,
    cache: DashMap<CacheKey, Option<KeyMaterial>>,
}

impl KeyScheduleEngine {
    /// Build and validate. A validation failure is kept, not returned.
    pub fn new<S>(strategy: S, fixtures: FixtureTable, config: EngineConfig) -> Self
    where
        S: KeySchedule + 'static,
    {
        Self::with_shared(Arc::new(strategy), fixtures, config)
    }

    /// Like [`KeyScheduleEngine::new`] for a strategy already behind an `Arc`.
    pub fn with_shared(
        strategy: Arc<dyn KeySchedule>,
        fixtures: FixtureTable,
        config: EngineConfig,
    ) -> Self {
        let health = match validate(strategy.as_ref(), &fixtures, &config) {
            Ok(()) => {
                tracing::debug!(
                    strategy = strategy.name(),
                    fixtures = fixtures.len(),
                    "key schedule validated"
                );
                EngineHealth::Ready {
                    fixtures: fixtures.len(),
                }
            }
            Err(err) => {
                tracing::error!(strategy = strategy.name(), error = %err, "key schedule failed validation");
                EngineHealth::Poisoned(err)
            }
        };
        Self {
            strategy,
            fixtures,
            config,
            health,
            cache: DashMap::new(),
        }
    }

    /// Build and validate, failing fast.
    pub fn try_new<S>(
        strategy: S,
        fixtures: FixtureTable,
        config: EngineConfig,
    ) -> std::result::Result<Self, ConsistencyError>
    where
        S: KeySchedule + 'static,
    {
        let engine = Self::new(strategy, fixtures, config);
        if let EngineHealth::Poisoned(err) = &engine.health {
            return Err(err.clone());
        }
        Ok(engine)
    }

    /// Skip validation. Used to score candidate strategies in the harness.
    pub fn unvalidated<S>(strategy: S, config: EngineConfig) -> Self
    where
        S: KeySchedule + 'static,
    {
        Self {
            strategy: Arc::new(strategy),
            fixtures: FixtureTable::new(),
            config,
            health: EngineHealth::Unvalidated,
            cache: DashMap::new(),
        }
    }

    /// Key for a (sequence, function code) pair under the active policy.
    pub fn schedule(&self, sequence: Sequence, function_code: u16, ctx: &KeyContext) -> Result<KeyMaterial> {
        self.ensure_usable()?;

        let unknown = UnknownKeyError {
            sequence,
            function_code: Some(function_code),
        };
        match self.derive(sequence, function_code, ctx) {
            Some(key) if !key.is_inferred() => Ok(key),
            Some(key) => match self.config.policy {
                KeyPolicy::Strict => Err(unknown.into()),
                KeyPolicy::Lenient => {
                    tracing::warn!(
                        %sequence,
                        function_code = format_args!("0x{function_code:04X}"),
                        confidence = %key.confidence(),
                        "using inferred key"
                    );
                    Ok(key)
                }
            },
            None => match self.config.policy {
                KeyPolicy::Strict => Err(unknown.into()),
                KeyPolicy::Lenient => self.nearest_fixture_key(sequence).ok_or_else(|| unknown.into()),
            },
        }
    }

    /// Detect a captured frame's function code and pick its key.
    ///
    /// Each candidate code is tried: a candidate survives when its key
    /// decrypts body bytes 8..10 back to the candidate itself. Survivors are
    /// scored by field plausibility. A single top score wins outright.
    /// Several codes sharing the top score are ambiguous: strict policy
    /// refuses the frame, lenient policy keeps the best-confirmed key but
    /// demotes it to inferred and lists the other codes.
    pub fn resolve(&self, frame: &Frame, ctx: &KeyContext) -> Result<ResolvedKey> {
        self.ensure_usable()?;

        let sequence = frame.sequence();
        let lenient = self.config.policy == KeyPolicy::Lenient;
        let mut survivors: Vec<(u32, ResolvedKey)> = Vec::new();

        for function_code in self.strategy.candidates(sequence) {
            let Some(key) = self.derive(sequence, function_code, ctx) else {
                continue;
            };
            if key.is_inferred() && !lenient {
                continue;
            }
            let packet = FieldCodec::decode(frame.body(), key.bytes());
            if packet.function_code != function_code {
                continue;
            }
            let score = plausibility(function_code, &packet, frame, &key);
            survivors.push((
                score,
                ResolvedKey {
                    function_code,
                    key,
                    alternatives: Vec::new(),
                },
            ));
        }

        // Stable: equal (score, verified) pairs stay in candidate order.
        survivors.sort_by_key(|(score, resolved)| std::cmp::Reverse((*score, resolved.key.verified_count())));
        let mut ranked = survivors.into_iter();

        if let Some((top, mut resolved)) = ranked.next() {
            let alternatives: Vec<u16> = ranked
                .take_while(|(score, _)| *score == top)
                .map(|(_, other)| other.function_code)
                .collect();

            if !alternatives.is_empty() {
                let mut candidates = vec![resolved.function_code];
                candidates.extend(&alternatives);
                if !lenient {
                    return Err(DetectionError::Ambiguous { sequence, candidates }.into());
                }
                let listed: Vec<String> = candidates.iter().map(|code| format!("0x{code:04X}")).collect();
                tracing::warn!(
                    %sequence,
                    candidates = %listed.join(" "),
                    "ambiguous function code, key demoted to inferred"
                );
                resolved.key = resolved.key.into_inferred(format!("ambiguous: {}", listed.join(" or ")));
                resolved.alternatives = alternatives;
                return Ok(resolved);
            }

            if resolved.key.is_inferred() {
                tracing::warn!(
                    %sequence,
                    function_code = format_args!("0x{:04X}", resolved.function_code),
                    confidence = %resolved.key.confidence(),
                    "frame decoded with inferred key"
                );
            }
            return Ok(resolved);
        }

        let unknown = UnknownKeyError {
            sequence,
            function_code: None,
        };
        if !lenient {
            return Err(unknown.into());
        }
        let key = self.nearest_fixture_key(sequence).ok_or(unknown)?;
        let function_code = FieldCodec::decode(frame.body(), key.bytes()).function_code;
        tracing::warn!(
            %sequence,
            function_code = format_args!("0x{function_code:04X}"),
            confidence = %key.confidence(),
            "no candidate matched, decoded with nearest fixture key"
        );
        Ok(ResolvedKey {
            function_code,
            key,
            alternatives: Vec::new(),
        })
    }

    /// Validation outcome.
    pub fn health(&self) -> &EngineHealth {
        &self.health
    }

    /// True unless poisoned.
    pub fn is_usable(&self) -> bool {
        !matches!(self.health, EngineHealth::Poisoned(_))
    }

    /// Runtime policy.
    pub fn policy(&self) -> KeyPolicy {
        self.config.policy
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fixtures the engine was validated against.
    pub fn fixtures(&self) -> &FixtureTable {
        &self.fixtures
    }

    /// Name of the underlying strategy.
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Number of cached derivations.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached derivation.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn ensure_usable(&self) -> Result<()> {
        match &self.health {
            EngineHealth::Poisoned(err) => Err(err.clone().into()),
            _ => Ok(()),
        }
    }

    fn derive(&self, sequence: Sequence, function_code: u16, ctx: &KeyContext) -> Option<KeyMaterial> {
        if !self.config.cache || self.config.cache_capacity == 0 {
            return self.strategy.derive(sequence, function_code, ctx);
        }
        let ctx = if self.strategy.uses_context() {
            *ctx
        } else {
            KeyContext::default()
        };
        let slot = (sequence, function_code, ctx);
        if let Some(hit) = self.cache.get(&slot) {
            return hit.value().clone();
        }
        self.make_room();
        // The entry guard holds the shard lock, so each slot is derived once.
        self.cache
            .entry(slot)
            .or_insert_with(|| {
                tracing::debug!(
                    %sequence,
                    function_code = format_args!("0x{function_code:04X}"),
                    "key cache fill"
                );
                self.strategy.derive(sequence, function_code, &ctx)
            })
            .value()
            .clone()
    }

    /// Evict one entry once the cache is at capacity.
    fn make_room(&self) {
        if self.cache.len() < self.config.cache_capacity {
            return;
        }
        // Copy the key out first; removing while the iterator holds a shard
        // guard would deadlock.
        let victim = self.cache.iter().next().map(|entry| *entry.key());
        if let Some(victim) = victim {
            self.cache.remove(&victim);
            tracing::trace!(capacity = self.config.cache_capacity, "key cache eviction");
        }
    }

    fn nearest_fixture_key(&self, sequence: Sequence) -> Option<KeyMaterial> {
        let fixture = self.fixtures.nearest(sequence)?;
        let bytes = fixture.key().map(|b| b.unwrap_or(FILLER_KEY_BYTE));
        Some(KeyMaterial::inferred(
            bytes,
            format!("nearest fixture '{}' (sequence {})", fixture.label(), fixture.sequence()),
        ))
    }
}

impl std::fmt::Debug for KeyScheduleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyScheduleEngine")
            .field("strategy", &self.strategy.name())
            .field("config", &self.config)
            .field("health", &self.health)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Re-derive every fixture and compare the verified key bytes.
pub fn validate(
    strategy: &dyn KeySchedule,
    fixtures: &FixtureTable,
    config: &EngineConfig,
) -> std::result::Result<(), ConsistencyError> {
    let sequences = fixtures.distinct_sequences();
    if fixtures.len() < config.min_fixtures || sequences < config.min_sequences {
        return Err(ConsistencyError::InsufficientFixtures {
            found: fixtures.len(),
            sequences,
            required: config.min_fixtures,
            required_sequences: config.min_sequences,
        });
    }

    let ctx = KeyContext::default();
    for fixture in fixtures {
        let derived = strategy
            .derive(fixture.sequence(), fixture.function_code(), &ctx)
            .ok_or_else(|| ConsistencyError::Underivable {
                strategy: strategy.name().to_string(),
                label: fixture.label().to_string(),
                sequence: fixture.sequence(),
                function_code: fixture.function_code(),
            })?;

        let body = fixture
            .key()
            .iter()
            .zip(derived.bytes())
            .enumerate()
            .find_map(|(position, (expected, derived))| match expected {
                Some(expected) if expected != derived => Some((position, *expected, *derived)),
                _ => None,
            });
        let extension = || {
            fixture
                .extension_key()
                .into_iter()
                .enumerate()
                .find_map(|(i, expected)| {
                    let got = derived.extension_byte(i);
                    (got != expected).then_some((BODY_SIZE + i, expected, got))
                })
        };
        let mismatch = body.or_else(extension);

        if let Some((position, expected, derived)) = mismatch {
            return Err(ConsistencyError::Divergence {
                label: fixture.label().to_string(),
                sequence: fixture.sequence(),
                function_code: fixture.function_code(),
                position,
                expected,
                derived,
            });
        }
    }
    Ok(())
}

/// Heuristic score for a candidate decode. Higher is more plausible.
fn plausibility(function_code: u16, packet: &DecodedPacket, frame: &Frame, key: &KeyMaterial) -> u32 {
    let mut score = 0;
    if packet.param2 == 0 {
        score += 100;
    }
    if is_movement(function_code) && packet.param1 == 0 {
        score += 200;
    } else if is_targeted(function_code) && packet.param1 != 0 {
        score += 50;
    }
    if packet.param1 < 0x00FF_FFFF {
        score += 10;
    }
    if let Some(text) = ExtensionCodec::decode_text(frame.extension(), key.extension()) {
        score += 5 * text.chars().count() as u32;
    }
    score
}
