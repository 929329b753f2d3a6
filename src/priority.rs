//! The decode priority calculation.
//!
//! Priority is a sum of additive bands. From most to least significant:
//!
//! - a large constant for boost classes at or above [BoostClass::High],
//! - the one-shot "additional" importance fed by renderers,
//! - how many discard levels the texture still has to go,
//! - the boost class ordinal,
//! - the on-screen pixel area.
//!
//! The band sizes are configuration, but the ordering between bands is what the rest of the pipeline relies on: a
//! boosted texture beats an unboosted one, and a texture far from its desired resolution beats one that is nearly
//! there.
use crate::BoostClass;

/// Anything below this is not worth fetching.
pub const MIN_FETCH_PRIORITY: f32 = 1.0;
/// The texture is exactly at its desired discard.
pub const PRIORITY_SATISFIED: f32 = 0.5;
/// The texture already has finer data than it wants.
pub const PRIORITY_SURPASSED: f32 = 0.25;

pub fn is_fetch_worthy(priority: f32) -> bool {
    priority >= MIN_FETCH_PRIORITY
}

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct PriorityConfig {
    /// Cap on `sqrt(max_virtual_size)`.
    pub pixel_max: f32,
    /// Weight of each missing discard level.
    pub delta_discard_factor: f32,
    pub max_delta_discard: i32,
    /// Weight of each boost class ordinal.
    pub boost_factor: f32,
    /// Flat bonus for boost classes at or above [BoostClass::High].
    pub boost_high_factor: f32,
    pub additional_factor: f32,
    pub max_additional: f32,
    /// Cached low-resolution images larger than this many pixels halve the size-driven terms.
    pub cached_area_threshold: u64,
    /// Side length of the placeholder every never-fetched texture is assumed to start from.
    pub placeholder_size: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        PriorityConfig {
            pixel_max: 999.0,
            delta_discard_factor: 100_000.0,
            max_delta_discard: 4,
            boost_factor: 1000.0,
            boost_high_factor: 10_000_000.0,
            additional_factor: 1_000_000.0,
            max_additional: 8.0,
            cached_area_threshold: 64 * 64,
            placeholder_size: 32,
        }
    }
}

impl PriorityConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let d = PriorityConfig::default();
        let config = PriorityConfig {
            pixel_max: self.pixel_max.unwrap_or(d.pixel_max),
            delta_discard_factor: self.delta_discard_factor.unwrap_or(d.delta_discard_factor),
            max_delta_discard: self.max_delta_discard.unwrap_or(d.max_delta_discard),
            boost_factor: self.boost_factor.unwrap_or(d.boost_factor),
            boost_high_factor: self.boost_high_factor.unwrap_or(d.boost_high_factor),
            additional_factor: self.additional_factor.unwrap_or(d.additional_factor),
            max_additional: self.max_additional.unwrap_or(d.max_additional),
            cached_area_threshold: self.cached_area_threshold.unwrap_or(d.cached_area_threshold),
            placeholder_size: self.placeholder_size.unwrap_or(d.placeholder_size),
        };
        let max = config.max_priority();
        if !(max >= MIN_FETCH_PRIORITY) {
            return Err(format!(
                "max_priority ({}) must be at least {}",
                max, MIN_FETCH_PRIORITY
            ));
        }
        Ok(())
    }
}

impl PriorityConfig {
    /// Upper bound of [DecodePriorityCalculator::priority].
    pub fn max_priority(&self) -> f32 {
        let top_boost = BoostClass::SuperHigh.ordinal() as f32 * self.boost_factor;
        self.pixel_max
            + self.max_delta_discard as f32 * self.delta_discard_factor
            + self.first_fetch_band()
            + self.max_additional * self.additional_factor
            + top_boost
            + self.boost_high_factor
    }

    /// Sub-range above the delta band reserved for never-fetched textures.
    fn first_fetch_band(&self) -> f32 {
        self.delta_discard_factor / 2.0
    }
}

/// The state of one texture as seen by the priority calculation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PriorityInputs {
    pub is_missing_asset: bool,
    pub was_deleted: bool,
    /// Best discard level with data so far; `None` before the first byte arrives.
    pub current_discard: Option<i32>,
    pub desired_discard: i32,
    /// Full resolution size, or 0 when not known yet.
    pub full_width: u32,
    pub full_height: u32,
    pub boost: BoostClass,
    pub max_virtual_size: f32,
    pub additional_priority: f32,
    /// Pixel count of the retained low-resolution image, 0 if there is none.
    pub cached_raw_pixels: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DecodePriorityCalculator {
    config: PriorityConfig,
}

impl DecodePriorityCalculator {
    pub fn new(config: PriorityConfig) -> DecodePriorityCalculator {
        DecodePriorityCalculator { config }
    }

    pub fn config(&self) -> &PriorityConfig {
        &self.config
    }

    pub fn max_priority(&self) -> f32 {
        self.config.max_priority()
    }

    /// Compute the priority, in `[0, max_priority()]`. Exactly 0 means the asset must never be fetched.
    pub fn priority(&self, inputs: &PriorityInputs) -> f32 {
        let cfg = &self.config;
        if inputs.is_missing_asset || inputs.was_deleted {
            return 0.0;
        }

        let base = match inputs.current_discard {
            Some(current) if current == inputs.desired_discard => return PRIORITY_SATISFIED,
            Some(current) if current < inputs.desired_discard => return PRIORITY_SURPASSED,
            Some(current) => {
                let delta = (current - inputs.desired_discard).clamp(1, cfg.max_delta_discard.max(1));
                delta as f32 * cfg.delta_discard_factor
            }
            None => {
                cfg.max_delta_discard as f32 * cfg.delta_discard_factor + self.first_fetch_bonus(inputs)
            }
        };

        let mut pixel = inputs.max_virtual_size.max(0.0).sqrt().min(cfg.pixel_max);
        let mut additional =
            inputs.additional_priority.clamp(0.0, cfg.max_additional) * cfg.additional_factor;
        if inputs.cached_raw_pixels > cfg.cached_area_threshold {
            pixel *= 0.5;
            additional *= 0.5;
        }

        let mut boost = inputs.boost.ordinal() as f32 * cfg.boost_factor;
        if inputs.boost.is_exempt_from_bias() {
            boost += cfg.boost_high_factor;
        }

        let ceiling = self.max_priority().max(MIN_FETCH_PRIORITY);
        (base + pixel + additional + boost).clamp(MIN_FETCH_PRIORITY, ceiling)
    }

    /// Never-fetched textures are ranked by how far their desired level is from the placeholder size, scaled into the
    /// first-fetch band.
    fn first_fetch_bonus(&self, inputs: &PriorityInputs) -> f32 {
        let cfg = &self.config;
        let long = inputs.full_width.max(inputs.full_height);
        if long == 0 || cfg.max_delta_discard <= 0 {
            return 0.0;
        }
        let mut placeholder_discard = 0;
        let mut side = long;
        while side > cfg.placeholder_size.max(1) {
            side >>= 1;
            placeholder_discard += 1;
        }
        let distance = (placeholder_discard - inputs.desired_discard).clamp(0, cfg.max_delta_discard);
        distance as f32 / cfg.max_delta_discard as f32 * cfg.first_fetch_band()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fetched(current: i32, desired: i32) -> PriorityInputs {
        PriorityInputs {
            current_discard: Some(current),
            desired_discard: desired,
            full_width: 1024,
            full_height: 1024,
            max_virtual_size: 256.0 * 256.0,
            ..Default::default()
        }
    }

    #[test]
    fn missing_and_deleted_are_zero() {
        let calc = DecodePriorityCalculator::default();
        let mut i = fetched(4, 0);
        i.is_missing_asset = true;
        assert_eq!(calc.priority(&i), 0.0);
        i.is_missing_asset = false;
        i.was_deleted = true;
        assert_eq!(calc.priority(&i), 0.0);
    }

    #[test]
    fn satisfied_sentinels_are_not_fetch_worthy() {
        let calc = DecodePriorityCalculator::default();
        let at = calc.priority(&fetched(2, 2));
        let past = calc.priority(&fetched(1, 2));
        assert_eq!(at, PRIORITY_SATISFIED);
        assert_eq!(past, PRIORITY_SURPASSED);
        assert!(!is_fetch_worthy(at));
        assert!(!is_fetch_worthy(past));
        assert!(at > 0.0 && past > 0.0);
        assert_ne!(at, past);
    }

    #[test]
    fn config_must_reach_the_fetch_floor() {
        assert!(PriorityConfigBuilder::default().build().is_ok());
        let flat = PriorityConfigBuilder::default()
            .pixel_max(0.0)
            .delta_discard_factor(0.0)
            .boost_factor(0.0)
            .boost_high_factor(0.0)
            .additional_factor(0.0)
            .build();
        assert!(flat.is_err());

        // Built by hand, the same config must still not panic.
        let calc = DecodePriorityCalculator::new(PriorityConfig {
            pixel_max: 0.0,
            delta_discard_factor: 0.0,
            boost_factor: 0.0,
            boost_high_factor: 0.0,
            additional_factor: 0.0,
            ..Default::default()
        });
        assert_eq!(calc.priority(&fetched(3, 0)), MIN_FETCH_PRIORITY);
    }

    #[test]
    fn bigger_discard_gap_wins() {
        let calc = DecodePriorityCalculator::default();
        let mut near = fetched(1, 0);
        near.max_virtual_size = 1e9;
        let mut far = fetched(3, 0);
        far.max_virtual_size = 1.0;
        assert!(calc.priority(&far) > calc.priority(&near));
    }

    #[test]
    fn boost_class_is_monotonic() {
        let calc = DecodePriorityCalculator::default();
        let mut last = 0.0;
        for boost in BoostClass::ALL.iter() {
            let mut i = fetched(3, 0);
            i.boost = *boost;
            let p = calc.priority(&i);
            assert!(p > last, "{:?} should beat the class below it", boost);
            last = p;
        }
    }

    #[test]
    fn high_boost_beats_any_normal_texture() {
        let calc = DecodePriorityCalculator::default();
        let mut normal = PriorityInputs {
            current_discard: None,
            desired_discard: 0,
            full_width: 2048,
            full_height: 2048,
            max_virtual_size: 1e12,
            additional_priority: 100.0,
            boost: BoostClass::Avatar,
            ..Default::default()
        };
        let mut high = fetched(1, 0);
        high.max_virtual_size = 0.0;
        high.boost = BoostClass::High;
        assert!(calc.priority(&high) > calc.priority(&normal));
        normal.boost = BoostClass::Normal;
        assert!(calc.priority(&high) > calc.priority(&normal));
    }

    #[test]
    fn never_fetched_beats_partially_fetched() {
        let calc = DecodePriorityCalculator::default();
        let partial = fetched(2, 0);
        let mut fresh = fetched(0, 0);
        fresh.current_discard = None;
        assert!(calc.priority(&fresh) > calc.priority(&partial));
    }

    #[test]
    fn first_fetch_ranked_by_distance_from_placeholder() {
        let calc = DecodePriorityCalculator::default();
        let mut big = fetched(0, 0);
        big.current_discard = None;
        big.full_width = 2048;
        big.full_height = 2048;
        let mut tiny = big;
        tiny.full_width = 32;
        tiny.full_height = 32;
        assert!(calc.priority(&big) > calc.priority(&tiny));
    }

    #[test]
    fn additional_priority_dominates_pixels() {
        let calc = DecodePriorityCalculator::default();
        let mut plain = fetched(2, 0);
        plain.max_virtual_size = 1e9;
        let mut important = fetched(2, 0);
        important.max_virtual_size = 0.0;
        important.additional_priority = 1.0;
        assert!(calc.priority(&important) > calc.priority(&plain));
    }

    #[test]
    fn cached_raw_halves_size_terms() {
        let calc = DecodePriorityCalculator::default();
        let mut i = fetched(2, 0);
        i.additional_priority = 2.0;
        let without = calc.priority(&i);
        i.cached_raw_pixels = 128 * 128;
        let with = calc.priority(&i);
        let expected_drop = (256.0 + 2.0 * 1_000_000.0) / 2.0;
        assert!((without - with - expected_drop).abs() < 1.0);

        // Small cached images do not count.
        i.cached_raw_pixels = 32 * 32;
        assert_eq!(calc.priority(&i), without);
    }

    #[test]
    fn max_priority_is_around_eighteen_million() {
        let max = PriorityConfig::default().max_priority();
        assert!(max > 1.8e7 && max < 1.9e7, "{}", max);
    }

    fn boost_strat() -> impl Strategy<Value = BoostClass> {
        (0..BoostClass::ALL.len()).prop_map(|i| BoostClass::ALL[i])
    }

    proptest! {
        #[test]
        fn priority_in_range(
            missing in any::<bool>(),
            deleted in any::<bool>(),
            current in proptest::option::of(0..12i32),
            desired in 0..12i32,
            w in 0..8192u32,
            h in 0..8192u32,
            boost in boost_strat(),
            vsize in 0.0..1e13f32,
            additional in 0.0..100.0f32,
            cached in 0..100_000u64,
        ) {
            let calc = DecodePriorityCalculator::default();
            let inputs = PriorityInputs {
                is_missing_asset: missing,
                was_deleted: deleted,
                current_discard: current,
                desired_discard: desired,
                full_width: w,
                full_height: h,
                boost,
                max_virtual_size: vsize,
                additional_priority: additional,
                cached_raw_pixels: cached,
            };
            let p = calc.priority(&inputs);
            prop_assert!(p >= 0.0 && p <= calc.max_priority());
            prop_assert_eq!(p == 0.0, missing || deleted);
        }
    }
}
