//! The multi-source velocity computer.
//!
//! Every key-down resolves to a velocity in [1, 127] from one of five
//! sources. Selection happens per key-down and is deterministic for a given
//! input history; there is no interpolation between sources inside a note.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::input::keymap::KeyRow;
use crate::time::MonotonicNanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VelocityMode {
    Timing,
    Pressure,
    Position,
    Combined,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VelocityCurve {
    Linear,
    Logarithmic,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VelocityConfig {
    pub mode: VelocityMode,
    pub curve: VelocityCurve,
    /// Timing window in milliseconds; gaps beyond this play at `vmin`.
    pub window_ms: u32,
    pub vmin: u8,
    pub vmax: u8,
    /// Velocity of the first note, when no previous key-down exists.
    pub baseline: u8,
    /// Normalized pressure below this reads as no pressure at all.
    pub pressure_threshold: f32,
    /// Exponential smoothing weight on the previously returned pressure;
    /// zero disables smoothing.
    pub smoothing: f32,
    pub fixed: u8,
    pub row_bottom: u8,
    pub row_home: u8,
    pub row_top: u8,
    /// Added (Shift) or subtracted (Ctrl) from the position value.
    pub modifier_delta: u8,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            mode: VelocityMode::Combined,
            curve: VelocityCurve::Logarithmic,
            window_ms: 500,
            vmin: 30,
            vmax: 127,
            baseline: 80,
            pressure_threshold: 0.05,
            smoothing: 0.0,
            fixed: 100,
            row_bottom: 40,
            row_home: 80,
            row_top: 110,
            modifier_delta: 20,
        }
    }
}

/// Which source the combined mode settled on for one key-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinedPick {
    Pressure,
    Position,
    Timing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedSource {
    Timing,
    Pressure,
    Position,
    Fixed,
    CombinedOf(CombinedPick),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityInfo {
    pub value: u8,
    pub source: ResolvedSource,
}

/// Per key-down inputs the computer does not track itself.
#[derive(Debug, Clone, Copy)]
pub struct StrikeContext {
    pub t: MonotonicNanos,
    pub row: Option<KeyRow>,
    pub accent: bool,
    pub soft: bool,
    pub touch_active: bool,
}

pub struct VelocityComputer {
    cfg: VelocityConfig,
    last_keydown: Option<MonotonicNanos>,
    latest_pressure: f32,
    smoothed_pressure: f32,
}

impl VelocityComputer {
    pub fn new(cfg: VelocityConfig) -> Self {
        Self { cfg, last_keydown: None, latest_pressure: 0.0, smoothed_pressure: 0.0 }
    }

    pub fn config(&self) -> &VelocityConfig {
        &self.cfg
    }

    /// Latest normalized pressure from the touchpad reader.
    pub fn set_pressure(&mut self, normalized: f32) {
        self.latest_pressure = normalized.clamp(0.0, 1.0);
    }

    /// Resolves the velocity for one key-down and records its timestamp for
    /// the next timing gap.
    pub fn compute(&mut self, ctx: StrikeContext) -> VelocityInfo {
        let info = match self.cfg.mode {
            VelocityMode::Timing => {
                VelocityInfo { value: self.timing_value(ctx.t), source: ResolvedSource::Timing }
            }
            VelocityMode::Pressure => VelocityInfo {
                value: self.pressure_value(),
                source: ResolvedSource::Pressure,
            },
            VelocityMode::Position => VelocityInfo {
                value: self.position_value(ctx.row, ctx.accent, ctx.soft),
                source: ResolvedSource::Position,
            },
            VelocityMode::Fixed => VelocityInfo {
                value: clamp_velocity(i32::from(self.cfg.fixed)),
                source: ResolvedSource::Fixed,
            },
            VelocityMode::Combined => self.combined(ctx),
        };

        self.last_keydown = Some(ctx.t);
        info
    }

    /// Priority pressure > position > timing. Pressure wins only while a
    /// touch is actually in contact and above the threshold.
    fn combined(&mut self, ctx: StrikeContext) -> VelocityInfo {
        if ctx.touch_active && self.latest_pressure >= self.cfg.pressure_threshold {
            VelocityInfo {
                value: self.pressure_value(),
                source: ResolvedSource::CombinedOf(CombinedPick::Pressure),
            }
        } else if ctx.row.is_some() {
            VelocityInfo {
                value: self.position_value(ctx.row, ctx.accent, ctx.soft),
                source: ResolvedSource::CombinedOf(CombinedPick::Position),
            }
        } else {
            VelocityInfo {
                value: self.timing_value(ctx.t),
                source: ResolvedSource::CombinedOf(CombinedPick::Timing),
            }
        }
    }

    fn timing_value(&self, t: MonotonicNanos) -> u8 {
        let last = match self.last_keydown {
            Some(last) => last,
            None => return clamp_velocity(i32::from(self.cfg.baseline)),
        };

        let window = f64::from(self.cfg.window_ms) / 1000.0;
        let gap = t.since(last).as_secs_f64().clamp(1e-6, window);

        let norm = match self.cfg.curve {
            VelocityCurve::Linear => 1.0 - gap / window,
            VelocityCurve::Logarithmic => 1.0 - (1.0 + gap).ln() / (1.0 + window).ln(),
            VelocityCurve::Exponential => (-3.0 * gap / window).exp(),
        };

        let span = f64::from(self.cfg.vmax) - f64::from(self.cfg.vmin);
        clamp_velocity((f64::from(self.cfg.vmin) + norm * span).round() as i32)
    }

    fn pressure_value(&mut self) -> u8 {
        // Threshold gate first, then smoothing against the last returned
        // value, then the curve.
        let gated =
            if self.latest_pressure < self.cfg.pressure_threshold { 0.0 } else { self.latest_pressure };

        let p = if self.cfg.smoothing > 0.0 {
            (1.0 - self.cfg.smoothing) * gated + self.cfg.smoothing * self.smoothed_pressure
        } else {
            gated
        };
        self.smoothed_pressure = p;

        let curved = match self.cfg.curve {
            VelocityCurve::Linear => f64::from(p),
            VelocityCurve::Logarithmic => (1.0 + f64::from(p)).ln() / 2f64.ln(),
            VelocityCurve::Exponential => ((3.0 * f64::from(p)).exp() - 1.0) / (3f64.exp() - 1.0),
        };

        clamp_velocity((1.0 + curved * 126.0).round() as i32)
    }

    fn position_value(&self, row: Option<KeyRow>, accent: bool, soft: bool) -> u8 {
        let base = match row {
            Some(KeyRow::Bottom) => self.cfg.row_bottom,
            Some(KeyRow::Home) | None => self.cfg.row_home,
            Some(KeyRow::Top) => self.cfg.row_top,
        };

        let mut value = i32::from(base);
        if accent {
            value += i32::from(self.cfg.modifier_delta);
        }
        if soft {
            value -= i32::from(self.cfg.modifier_delta);
        }
        clamp_velocity(value)
    }
}

#[inline]
fn clamp_velocity(value: i32) -> u8 {
    value.clamp(1, 127) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> MonotonicNanos {
        MonotonicNanos(v * 1_000_000)
    }

    fn ctx(t: MonotonicNanos) -> StrikeContext {
        StrikeContext { t, row: None, accent: false, soft: false, touch_active: false }
    }

    fn timing_computer() -> VelocityComputer {
        VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Timing,
            ..VelocityConfig::default()
        })
    }

    #[test]
    fn first_strike_uses_the_baseline() {
        let mut vc = timing_computer();
        let info = vc.compute(ctx(ms(0)));
        assert_eq!(info.value, 80);
        assert_eq!(info.source, ResolvedSource::Timing);
    }

    #[test]
    fn fast_second_strike_is_louder_than_baseline() {
        let mut vc = timing_computer();
        vc.compute(ctx(ms(0)));
        let info = vc.compute(ctx(ms(50)));
        assert!(info.value > 80, "50 ms gap gave {}", info.value);
        assert!(info.value < 127);
    }

    #[test]
    fn gaps_beyond_the_window_floor_at_vmin() {
        let mut vc = timing_computer();
        vc.compute(ctx(ms(0)));
        let info = vc.compute(ctx(ms(2_000)));
        assert_eq!(info.value, 30);
    }

    #[test]
    fn timing_is_monotonic_in_the_gap() {
        for curve in [VelocityCurve::Linear, VelocityCurve::Logarithmic, VelocityCurve::Exponential]
        {
            let mut prev = 128u8;
            for gap in [5u64, 50, 150, 300, 499] {
                let mut vc = VelocityComputer::new(VelocityConfig {
                    mode: VelocityMode::Timing,
                    curve,
                    ..VelocityConfig::default()
                });
                vc.compute(ctx(ms(0)));
                let v = vc.compute(ctx(ms(gap))).value;
                assert!(v <= prev, "{curve:?}: gap {gap} gave {v} after {prev}");
                prev = v;
            }
        }
    }

    #[test]
    fn pressure_below_threshold_reads_as_silence_floor() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Pressure,
            ..VelocityConfig::default()
        });
        vc.set_pressure(0.01);
        assert_eq!(vc.compute(ctx(ms(0))).value, 1);
        vc.set_pressure(0.9);
        assert!(vc.compute(ctx(ms(1))).value > 100);
    }

    #[test]
    fn position_rows_and_modifiers() {
        let vc_cfg = VelocityConfig { mode: VelocityMode::Position, ..VelocityConfig::default() };
        let mut vc = VelocityComputer::new(vc_cfg);
        let mut c = ctx(ms(0));
        c.row = Some(KeyRow::Bottom);
        assert_eq!(vc.compute(c).value, 40);
        c.row = Some(KeyRow::Top);
        c.accent = true;
        assert_eq!(vc.compute(c).value, 127);
        c.accent = false;
        c.soft = true;
        assert_eq!(vc.compute(c).value, 90);
    }

    #[test]
    fn combined_prefers_pressure_only_while_touching() {
        let mut vc = VelocityComputer::new(VelocityConfig::default());
        vc.set_pressure(0.8);

        let mut c = ctx(ms(0));
        c.row = Some(KeyRow::Home);
        c.touch_active = true;
        assert_eq!(vc.compute(c).source, ResolvedSource::CombinedOf(CombinedPick::Pressure));

        c.touch_active = false;
        assert_eq!(vc.compute(c).source, ResolvedSource::CombinedOf(CombinedPick::Position));

        c.row = None;
        assert_eq!(vc.compute(c).source, ResolvedSource::CombinedOf(CombinedPick::Timing));
    }

    #[test]
    fn every_source_stays_inside_midi_bounds() {
        let mut vc = VelocityComputer::new(VelocityConfig {
            mode: VelocityMode::Fixed,
            fixed: 0,
            ..VelocityConfig::default()
        });
        assert_eq!(vc.compute(ctx(ms(0))).value, 1);
    }
}
