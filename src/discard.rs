//! The discard level policy: how much resolution a texture deserves.
//!
//! A discard level of 0 is full resolution; each step up halves both dimensions. The policy is a pure function of the
//! texture's full size, how large it appears on screen, its [BoostClass], and the global memory bias maintained by
//! [crate::MemoryBiasController].
use crate::BoostClass;

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct DiscardConfig {
    /// Coarsest discard level the pipeline will ever ask for.
    pub max_discard: i32,
    /// Discard requested for textures whose full size is not known yet.
    pub initial_discard: i32,
    /// Textures are always discarded far enough to fit in this many texels per side.
    pub max_texture_dimension: u32,
}

impl Default for DiscardConfig {
    fn default() -> Self {
        DiscardConfig {
            max_discard: 5,
            initial_discard: 5,
            max_texture_dimension: 2048,
        }
    }
}

impl DiscardConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_discard {
            if max < 0 {
                return Err("max_discard must not be negative".into());
            }
        }
        if let Some(0) = self.max_texture_dimension {
            return Err("max_texture_dimension must be positive".into());
        }
        Ok(())
    }
}

/// Everything the policy looks at for one texture.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardInputs {
    /// Full resolution size, or 0 when not known yet.
    pub full_width: u32,
    pub full_height: u32,
    /// Exact on-screen area in pixels when a renderer knows it.
    pub known_draw_area: Option<f32>,
    /// Largest estimated on-screen area since the last reset.
    pub max_virtual_size: f32,
    pub boost: BoostClass,
    pub memory_bias: f32,
    /// Per-texture floor; the result is never finer than this.
    pub min_discard: i32,
}

#[derive(Debug, Clone, Default)]
pub struct DiscardPolicy {
    config: DiscardConfig,
}

impl DiscardPolicy {
    pub fn new(config: DiscardConfig) -> DiscardPolicy {
        DiscardPolicy { config }
    }

    pub fn config(&self) -> &DiscardConfig {
        &self.config
    }

    /// Coarsest useful discard for an image of this size: stop once the short side would reach a single texel.
    pub fn max_discard_for(&self, width: u32, height: u32) -> i32 {
        if width == 0 || height == 0 {
            return self.config.max_discard;
        }
        let short = width.min(height);
        let levels = (31 - short.leading_zeros()) as i32;
        levels.min(self.config.max_discard)
    }

    /// Finest discard at which the long side fits in `max_texture_dimension`.
    pub fn dimension_floor(&self, width: u32, height: u32) -> i32 {
        let mut long = width.max(height);
        let mut discard = 0;
        while long > self.config.max_texture_dimension {
            long >>= 1;
            discard += 1;
        }
        discard
    }

    /// Compute the desired discard level.
    ///
    /// Increasing `memory_bias` never lowers the result and increasing the draw area never raises it.
    pub fn desired_discard(&self, inputs: &DiscardInputs) -> i32 {
        let (w, h) = (inputs.full_width, inputs.full_height);
        let max = self.max_discard_for(w, h);
        if w == 0 || h == 0 {
            return self
                .config
                .initial_discard
                .max(inputs.min_discard)
                .clamp(0, max);
        }

        let full_area = w as f32 * h as f32;
        let on_screen = match inputs.known_draw_area {
            Some(area) => area,
            None => inputs.max_virtual_size,
        };
        let mut discard = if on_screen > 0.0 {
            // log2(sqrt(full / area)), which is the same as log4(full / area).
            (0.5 * (full_area / on_screen).log2()).max(0.0)
        } else {
            max as f32
        };

        if !inputs.boost.is_exempt_from_bias() {
            discard += inputs.memory_bias.max(0.0);
        }

        let floor = inputs
            .min_discard
            .max(self.dimension_floor(w, h))
            .clamp(0, max);
        (discard.floor() as i32).clamp(floor, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inputs(w: u32, h: u32) -> DiscardInputs {
        DiscardInputs {
            full_width: w,
            full_height: h,
            ..Default::default()
        }
    }

    #[test]
    fn known_area_drives_discard() {
        let policy = DiscardPolicy::default();
        let mut i = inputs(1024, 1024);
        i.known_draw_area = Some(1024.0 * 1024.0);
        assert_eq!(policy.desired_discard(&i), 0);
        i.known_draw_area = Some(256.0 * 256.0);
        assert_eq!(policy.desired_discard(&i), 2);
        i.known_draw_area = Some(4.0 * 4096.0 * 4096.0);
        assert_eq!(policy.desired_discard(&i), 0, "larger than full clamps to 0");
    }

    #[test]
    fn virtual_size_used_when_area_unknown() {
        let policy = DiscardPolicy::default();
        let mut i = inputs(512, 512);
        i.max_virtual_size = 128.0 * 128.0;
        assert_eq!(policy.desired_discard(&i), 2);
        i.max_virtual_size = 0.0;
        assert_eq!(policy.desired_discard(&i), 5, "invisible textures get the coarsest level");
    }

    #[test]
    fn unknown_size_uses_initial_discard() {
        let policy = DiscardPolicy::default();
        assert_eq!(policy.desired_discard(&inputs(0, 0)), 5);
    }

    #[test]
    fn bias_exempt_classes() {
        let policy = DiscardPolicy::default();
        let mut i = inputs(1024, 1024);
        i.known_draw_area = Some(1024.0 * 1024.0);
        i.memory_bias = 2.0;
        assert_eq!(policy.desired_discard(&i), 2);
        i.boost = BoostClass::Ui;
        assert_eq!(policy.desired_discard(&i), 0);
        i.boost = BoostClass::AvatarBake;
        assert_eq!(policy.desired_discard(&i), 0);
    }

    #[test]
    fn oversized_textures_are_discarded_to_fit() {
        let policy = DiscardPolicy::default();
        let mut i = inputs(8192, 8192);
        i.known_draw_area = Some(8192.0 * 8192.0);
        assert_eq!(policy.desired_discard(&i), 2);
    }

    #[test]
    fn small_textures_have_fewer_levels() {
        let policy = DiscardPolicy::default();
        assert_eq!(policy.max_discard_for(4, 64), 2);
        assert_eq!(policy.max_discard_for(1, 1), 0);
        assert_eq!(policy.max_discard_for(2048, 2048), 5);
        let mut i = inputs(4, 4);
        i.max_virtual_size = 0.0;
        assert_eq!(policy.desired_discard(&i), 2);
    }

    #[test]
    fn min_discard_is_respected() {
        let policy = DiscardPolicy::default();
        let mut i = inputs(1024, 1024);
        i.known_draw_area = Some(1024.0 * 1024.0);
        i.min_discard = 3;
        assert_eq!(policy.desired_discard(&i), 3);
    }

    #[test]
    fn builder_rejects_negative_max() {
        assert!(DiscardConfigBuilder::default()
            .max_discard(-1)
            .build()
            .is_err());
        let cfg = DiscardConfigBuilder::default()
            .max_discard(3)
            .build()
            .expect("Should build");
        assert_eq!(cfg.max_discard, 3);
        assert_eq!(cfg.max_texture_dimension, 2048);
    }

    fn boost_strat() -> impl Strategy<Value = BoostClass> {
        (0..BoostClass::ALL.len()).prop_map(|i| BoostClass::ALL[i])
    }

    proptest! {
        #[test]
        fn bias_never_lowers_discard(
            w in 1..4096u32,
            h in 1..4096u32,
            area in 0.0..20_000_000.0f32,
            bias in 0.0..5.0f32,
            extra in 0.0..5.0f32,
            boost in boost_strat(),
        ) {
            let policy = DiscardPolicy::default();
            let mut i = inputs(w, h);
            i.known_draw_area = Some(area);
            i.boost = boost;
            i.memory_bias = bias;
            let low = policy.desired_discard(&i);
            i.memory_bias = bias + extra;
            let high = policy.desired_discard(&i);
            prop_assert!(high >= low);
            prop_assert!((0..=policy.max_discard_for(w, h)).contains(&high));
        }

        #[test]
        fn area_never_raises_discard(
            w in 1..4096u32,
            h in 1..4096u32,
            area in 0.0..20_000_000.0f32,
            extra in 0.0..20_000_000.0f32,
            bias in 0.0..5.0f32,
        ) {
            let policy = DiscardPolicy::default();
            let mut i = inputs(w, h);
            i.memory_bias = bias;
            i.known_draw_area = Some(area);
            let small = policy.desired_discard(&i);
            i.known_draw_area = Some(area + extra);
            let big = policy.desired_discard(&i);
            prop_assert!(big <= small);
        }
    }
}
