//! Static description of every ryzenadj tunable this tool knows about.
//!
//! Order matters: apply and capture walk the catalog front to back, so
//! repeated applies of the same profile issue the same command sequence.

use crate::error::{Error, Result};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Power,
    Current,
    Clocks,
    Advanced,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Power => write!(f, "Power"),
            Category::Current => write!(f, "Current"),
            Category::Clocks => write!(f, "Clocks"),
            Category::Advanced => write!(f, "Advanced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Sent as `--flag <value>`.
    Numeric,
    /// Sent as a bare `--flag`; the stored value is 0 or 1.
    Flag,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub id: &'static str,
    /// ryzenadj command-line flag, including the leading dashes.
    pub flag: &'static str,
    pub label: &'static str,
    pub category: Category,
    /// Unit shown to the user. Raw values are divided by `scale` for display.
    pub unit: &'static str,
    pub min: u32,
    pub max: u32,
    pub default: u32,
    pub scale: u32,
    pub kind: ParameterKind,
    /// Whether `ryzenadj --info` reports this value, so it can be captured
    /// into the initial default snapshot.
    pub capturable: bool,
}

impl ParameterSpec {
    pub const fn numeric(
        id: &'static str,
        flag: &'static str,
        label: &'static str,
        category: Category,
        unit: &'static str,
        max: u32,
        default: u32,
    ) -> Self {
        Self {
            id,
            flag,
            label,
            category,
            unit,
            min: 0,
            max,
            default,
            scale: 1,
            kind: ParameterKind::Numeric,
            capturable: true,
        }
    }

    /// Power limits: stored in mW, shown in W.
    pub const fn power(id: &'static str, flag: &'static str, label: &'static str, default: u32) -> Self {
        let mut spec = Self::numeric(id, flag, label, Category::Power, "W", 200_000, default);
        spec.scale = 1000;
        spec
    }

    pub const fn mode(id: &'static str, flag: &'static str, label: &'static str) -> Self {
        Self {
            id,
            flag,
            label,
            category: Category::Advanced,
            unit: "",
            min: 0,
            max: 1,
            default: 0,
            scale: 1,
            kind: ParameterKind::Flag,
            capturable: false,
        }
    }

    pub fn validate(&self, value: u32) -> Result<()> {
        if value < self.min || value > self.max {
            return Err(Error::InvalidValue {
                parameter: self.id.to_string(),
                detail: format!("{} is outside {}..={}", value, self.min, self.max),
            });
        }
        Ok(())
    }

    /// Format a raw value the way a user reads it (e.g. 15000 mW -> "15 W").
    pub fn display_value(&self, raw: u32) -> String {
        if self.kind == ParameterKind::Flag {
            return if raw != 0 { "on".into() } else { "off".into() };
        }
        let shown = if self.scale > 1 {
            let whole = raw / self.scale;
            let frac = raw % self.scale;
            if frac == 0 {
                whole.to_string()
            } else {
                format!("{:.1}", raw as f64 / self.scale as f64)
            }
        } else {
            raw.to_string()
        };
        if self.unit.is_empty() {
            shown
        } else {
            format!("{} {}", shown, self.unit)
        }
    }

    /// Convert a number read from `ryzenadj --info` to raw units.
    ///
    /// ryzenadj reports power limits in watts; anything that fits the
    /// display range is assumed to be in display units and scaled up.
    /// Readings outside `min..=max` are refused rather than clamped.
    pub fn from_reported(&self, reported: f64) -> Option<u32> {
        if !reported.is_finite() || reported < 0.0 {
            return None;
        }
        let mut raw = reported.round() as u64;
        if self.scale > 1 && reported <= (self.max / self.scale) as f64 {
            raw = (reported * self.scale as f64).round() as u64;
        }
        u32::try_from(raw)
            .ok()
            .filter(|v| (self.min..=self.max).contains(v))
    }

    /// Whether an enabled `value` produces an invocation. A mode flag set
    /// to 0 means "leave the mode alone".
    pub fn is_sent(&self, value: u32) -> bool {
        self.kind == ParameterKind::Numeric || value != 0
    }

    /// Arguments for one ryzenadj invocation setting this parameter, or
    /// `None` when nothing is sent for `value`.
    pub fn command_args(&self, value: u32) -> Option<Vec<String>> {
        match self.kind {
            ParameterKind::Numeric => Some(vec![self.flag.to_string(), value.to_string()]),
            ParameterKind::Flag if value != 0 => Some(vec![self.flag.to_string()]),
            ParameterKind::Flag => None,
        }
    }
}

pub const POWER_SAVING: &str = "power_saving";
pub const MAX_PERFORMANCE: &str = "max_performance";

static PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::power("stapm_limit", "--stapm-limit", "STAPM Limit", 25_000),
    ParameterSpec::power("fast_limit", "--fast-limit", "PPT Fast Limit", 35_000),
    ParameterSpec::power("slow_limit", "--slow-limit", "PPT Slow Limit", 30_000),
    ParameterSpec::numeric("slow_time", "--slow-time", "Slow Time", Category::Power, "s", 512, 64),
    ParameterSpec::numeric("stapm_time", "--stapm-time", "STAPM Time", Category::Power, "s", 512, 64),
    ParameterSpec::numeric("tctl_temp", "--tctl-temp", "Tctl Temp", Category::Power, "°C", 105, 90),
    ParameterSpec::power("apu_slow_limit", "--apu-slow-limit", "APU Slow Limit", 30_000),
    ParameterSpec::numeric(
        "skin_temp_limit",
        "--skin-temp-limit",
        "Skin Temp Limit",
        Category::Power,
        "°C",
        100,
        60,
    ),
    ParameterSpec::numeric("apu_skin_temp", "--apu-skin-temp", "APU Skin Temp", Category::Power, "°C", 100, 55),
    ParameterSpec::numeric(
        "dgpu_skin_temp",
        "--dgpu-skin-temp",
        "dGPU Skin Temp",
        Category::Power,
        "°C",
        100,
        60,
    ),
    ParameterSpec::numeric("vrm_current", "--vrm-current", "VRM Current", Category::Current, "A", 400, 100),
    ParameterSpec::numeric(
        "vrmsoc_current",
        "--vrmsoc-current",
        "VRMSoC Current",
        Category::Current,
        "A",
        400,
        80,
    ),
    ParameterSpec::numeric(
        "vrmmax_current",
        "--vrmmax-current",
        "VRM Max Current",
        Category::Current,
        "A",
        500,
        130,
    ),
    ParameterSpec::numeric(
        "vrmsocmax_current",
        "--vrmsocmax-current",
        "VRMSoC Max Current",
        Category::Current,
        "A",
        500,
        110,
    ),
    ParameterSpec::numeric("psi0_current", "--psi0-current", "PSI0 Current", Category::Current, "A", 500, 80),
    ParameterSpec::numeric(
        "psi0soc_current",
        "--psi0soc-current",
        "PSI0SoC Current",
        Category::Current,
        "A",
        500,
        60,
    ),
    ParameterSpec::numeric(
        "max_socclk_frequency",
        "--max-socclk-frequency",
        "Max SoC Clock",
        Category::Clocks,
        "MHz",
        4000,
        1800,
    ),
    ParameterSpec::numeric(
        "min_socclk_frequency",
        "--min-socclk-frequency",
        "Min SoC Clock",
        Category::Clocks,
        "MHz",
        4000,
        400,
    ),
    ParameterSpec::numeric(
        "max_fclk_frequency",
        "--max-fclk-frequency",
        "Max FCLK",
        Category::Clocks,
        "MHz",
        4000,
        1800,
    ),
    ParameterSpec::numeric(
        "min_fclk_frequency",
        "--min-fclk-frequency",
        "Min FCLK",
        Category::Clocks,
        "MHz",
        4000,
        400,
    ),
    ParameterSpec::numeric("max_vcn", "--max-vcn", "Max VCN", Category::Clocks, "MHz", 4000, 1200),
    ParameterSpec::numeric("min_vcn", "--min-vcn", "Min VCN", Category::Clocks, "MHz", 4000, 300),
    ParameterSpec::numeric("max_lclk", "--max-lclk", "Max LCLK", Category::Clocks, "MHz", 4000, 1200),
    ParameterSpec::numeric("min_lclk", "--min-lclk", "Min LCLK", Category::Clocks, "MHz", 4000, 300),
    ParameterSpec::numeric("max_gfxclk", "--max-gfxclk", "Max GFX Clock", Category::Clocks, "MHz", 4000, 2200),
    ParameterSpec::numeric("min_gfxclk", "--min-gfxclk", "Min GFX Clock", Category::Clocks, "MHz", 4000, 400),
    ParameterSpec::numeric(
        "prochot_deassertion_ramp",
        "--prochot-deassertion-ramp",
        "Prochot Deassertion Ramp",
        Category::Advanced,
        "",
        255,
        50,
    ),
    ParameterSpec::mode(POWER_SAVING, "--power-saving", "Power Saving"),
    ParameterSpec::mode(MAX_PERFORMANCE, "--max-performance", "Max Performance"),
];

/// The canonical, ordered parameter list.
pub fn parameters() -> &'static [ParameterSpec] {
    PARAMETERS
}

pub fn find(id: &str) -> Option<&'static ParameterSpec> {
    PARAMETERS.iter().find(|p| p.id == id)
}

/// Position of `id` in catalog order, used to sort apply batches.
pub fn position(id: &str) -> Option<usize> {
    PARAMETERS.iter().position(|p| p.id == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_and_flags_are_unique() {
        let ids: HashSet<_> = parameters().iter().map(|p| p.id).collect();
        let flags: HashSet<_> = parameters().iter().map(|p| p.flag).collect();
        assert_eq!(ids.len(), parameters().len());
        assert_eq!(flags.len(), parameters().len());
    }

    #[test]
    fn test_defaults_within_bounds() {
        for spec in parameters() {
            assert!(spec.validate(spec.default).is_ok(), "{}", spec.id);
        }
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let tctl = find("tctl_temp").unwrap();
        assert!(tctl.validate(105).is_ok());
        assert!(matches!(
            tctl.validate(106),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_display_value() {
        let stapm = find("stapm_limit").unwrap();
        assert_eq!(stapm.display_value(15_000), "15 W");
        assert_eq!(stapm.display_value(15_500), "15.5 W");
        assert_eq!(find("max_gfxclk").unwrap().display_value(2200), "2200 MHz");
        assert_eq!(find(POWER_SAVING).unwrap().display_value(1), "on");
    }

    #[test]
    fn test_from_reported_scales_watts() {
        let stapm = find("stapm_limit").unwrap();
        assert_eq!(stapm.from_reported(25.0), Some(25_000));
        assert_eq!(stapm.from_reported(25_000.0), Some(25_000));
        assert_eq!(stapm.from_reported(f64::NAN), None);
        assert_eq!(find("tctl_temp").unwrap().from_reported(95.4), Some(95));
    }

    #[test]
    fn test_from_reported_refuses_out_of_range() {
        assert_eq!(find("tctl_temp").unwrap().from_reported(130.0), None);
        assert_eq!(find("stapm_limit").unwrap().from_reported(250_000.0), None);
        assert_eq!(find("stapm_limit").unwrap().from_reported(200.0), Some(200_000));
    }

    #[test]
    fn test_command_args() {
        assert_eq!(
            find("fast_limit").unwrap().command_args(20_000),
            Some(vec!["--fast-limit".to_string(), "20000".to_string()])
        );
        assert_eq!(
            find("fast_limit").unwrap().command_args(0),
            Some(vec!["--fast-limit".to_string(), "0".to_string()])
        );
        let max_perf = find(MAX_PERFORMANCE).unwrap();
        assert_eq!(max_perf.command_args(1), Some(vec!["--max-performance".to_string()]));
        assert_eq!(max_perf.command_args(0), None);
        assert!(!max_perf.is_sent(0));
        assert!(find("fast_limit").unwrap().is_sent(0));
    }

    #[test]
    fn test_position_follows_declaration_order() {
        assert_eq!(position("stapm_limit"), Some(0));
        assert!(position("fast_limit") < position("min_gfxclk"));
        assert_eq!(position("nonexistent"), None);
    }
}
