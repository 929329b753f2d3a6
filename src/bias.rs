//! The global memory bias: an additive discard penalty raised under memory pressure and lowered slowly once it passes.
//!
//! Raising is quick but lowering waits for the pressure to stay low for a sustained period, which grows with the
//! current bias. Any two changes are at least one hysteresis window apart. Together these keep resolution from
//! yo-yoing when usage hovers around the budget.
use std::time::{Duration, Instant};

#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(default, build_fn(validate = "Self::validate"))]
pub struct MemoryBiasConfig {
    /// Usage above this fraction of budget raises the bias.
    pub raise_fraction: f32,
    /// Usage must stay below this fraction of budget before the bias is lowered.
    pub lower_fraction: f32,
    pub step: f32,
    pub max_bias: f32,
    /// Minimum time between any two changes.
    pub hysteresis: Duration,
    /// Extra time usage must stay low per unit of current bias before lowering.
    pub decrease_delay_per_bias: Duration,
}

impl Default for MemoryBiasConfig {
    fn default() -> Self {
        MemoryBiasConfig {
            raise_fraction: 0.9,
            lower_fraction: 0.6,
            step: 0.5,
            max_bias: 4.0,
            hysteresis: Duration::from_secs(2),
            decrease_delay_per_bias: Duration::from_secs(5),
        }
    }
}

impl MemoryBiasConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let raise = self.raise_fraction.unwrap_or(0.9);
        let lower = self.lower_fraction.unwrap_or(0.6);
        if lower >= raise {
            return Err(format!(
                "lower_fraction ({}) must be below raise_fraction ({})",
                lower, raise
            ));
        }
        Ok(())
    }
}

/// Texture memory usage as reported by the renderer, in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryPressure {
    pub vram_used: u64,
    pub vram_budget: u64,
    pub bound_used: u64,
    pub bound_budget: u64,
}

impl MemoryPressure {
    /// The worse of the two usage fractions. A zero budget counts as no pressure.
    pub fn fraction(&self) -> f32 {
        fn frac(used: u64, budget: u64) -> f32 {
            if budget == 0 {
                0.0
            } else {
                used as f32 / budget as f32
            }
        }
        frac(self.vram_used, self.vram_budget).max(frac(self.bound_used, self.bound_budget))
    }
}

#[derive(Debug)]
pub struct MemoryBiasController {
    config: MemoryBiasConfig,
    bias: f32,
    last_change: Option<Instant>,
    low_since: Option<Instant>,
}

impl MemoryBiasController {
    pub fn new(config: MemoryBiasConfig) -> MemoryBiasController {
        MemoryBiasController {
            config,
            bias: 0.0,
            last_change: None,
            low_since: None,
        }
    }

    pub fn bias(&self) -> f32 {
        self.bias
    }

    pub fn last_change(&self) -> Option<Instant> {
        self.last_change
    }

    /// Feed one pressure sample and return the (possibly updated) bias.
    pub fn update(&mut self, now: Instant, pressure: MemoryPressure) -> f32 {
        let fraction = pressure.fraction();
        let window_open = self
            .last_change
            .map_or(true, |t| now.saturating_duration_since(t) >= self.config.hysteresis);

        if fraction > self.config.raise_fraction {
            self.low_since = None;
            if window_open && self.bias < self.config.max_bias {
                self.bias = (self.bias + self.config.step).min(self.config.max_bias);
                self.last_change = Some(now);
                tracing::debug!(bias = self.bias, fraction, "raised texture memory bias");
            }
        } else if fraction < self.config.lower_fraction {
            let low_since = *self.low_since.get_or_insert(now);
            let required = self.config.hysteresis
                + self.config.decrease_delay_per_bias.mul_f32(self.bias.max(0.0));
            if window_open
                && self.bias > 0.0
                && now.saturating_duration_since(low_since) >= required
            {
                self.bias = (self.bias - self.config.step).max(0.0);
                self.last_change = Some(now);
                // Lowering again needs another full sustained period.
                self.low_since = Some(now);
                tracing::debug!(bias = self.bias, fraction, "lowered texture memory bias");
            }
        } else {
            self.low_since = None;
        }

        self.bias
    }
}

impl Default for MemoryBiasController {
    fn default() -> Self {
        MemoryBiasController::new(MemoryBiasConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pressure(fraction: f32) -> MemoryPressure {
        MemoryPressure {
            vram_used: (fraction * 1000.0) as u64,
            vram_budget: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn fraction_takes_the_worse_signal() {
        let p = MemoryPressure {
            vram_used: 10,
            vram_budget: 100,
            bound_used: 80,
            bound_budget: 100,
        };
        assert!((p.fraction() - 0.8).abs() < 1e-6);
        assert_eq!(MemoryPressure::default().fraction(), 0.0);
    }

    #[test]
    fn raises_under_pressure_and_caps() {
        let mut c = MemoryBiasController::default();
        let start = Instant::now();
        let mut t = start;
        for _ in 0..20 {
            c.update(t, pressure(0.95));
            t += Duration::from_secs(3);
        }
        assert_eq!(c.bias(), 4.0);
    }

    #[test]
    fn lowering_needs_sustained_low_usage() {
        let mut c = MemoryBiasController::default();
        let start = Instant::now();
        c.update(start, pressure(0.95));
        assert_eq!(c.bias(), 0.5);

        // 2s hysteresis + 0.5 * 5s = 4.5s of low usage needed.
        let mut t = start + Duration::from_secs(3);
        c.update(t, pressure(0.1));
        t += Duration::from_secs(4);
        assert_eq!(c.update(t, pressure(0.1)), 0.5);
        t += Duration::from_secs(1);
        assert_eq!(c.update(t, pressure(0.1)), 0.0);
    }

    #[test]
    fn mid_band_usage_resets_the_low_timer() {
        let mut c = MemoryBiasController::default();
        let start = Instant::now();
        c.update(start, pressure(0.95));
        let mut t = start + Duration::from_secs(3);
        c.update(t, pressure(0.1));
        t += Duration::from_secs(4);
        c.update(t, pressure(0.7));
        t += Duration::from_secs(1);
        assert_eq!(c.update(t, pressure(0.1)), 0.5);
    }

    #[test]
    fn oscillation_changes_at_most_once_per_window() {
        let config = MemoryBiasConfigBuilder::default()
            .hysteresis(Duration::from_secs(2))
            .decrease_delay_per_bias(Duration::from_secs(0))
            .build()
            .expect("Should build");
        let mut c = MemoryBiasController::new(config);
        let start = Instant::now();
        let mut changes = vec![];
        let mut last = c.bias();

        // Flip between high and low usage every 100ms for 20 seconds.
        for i in 0..200u64 {
            let t = start + Duration::from_millis(i * 100);
            let p = if i % 2 == 0 { 0.95 } else { 0.1 };
            let b = c.update(t, pressure(p));
            if b != last {
                changes.push(t);
                last = b;
            }
        }

        assert!(!changes.is_empty());
        for pair in changes.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2));
        }
    }

    #[test]
    fn builder_checks_thresholds() {
        assert!(MemoryBiasConfigBuilder::default()
            .raise_fraction(0.5)
            .lower_fraction(0.7)
            .build()
            .is_err());
    }
}
