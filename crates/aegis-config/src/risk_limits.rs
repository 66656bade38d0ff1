//! Parses `RiskLimits` out of a loaded, merged configuration document.
//!
//! Ratios are written in configuration as decimal strings (`"0.15"`, not
//! `0.15`) so the YAML layer never round-trips through a binary float —
//! `serde_yaml` would otherwise happily parse `0.15` as an `f64` before we
//! ever get a chance to reject it.

use aegis_money::Ratio;
use aegis_schemas::RiskLimits;
use serde::Deserialize;

use crate::{ConfigError, LoadedConfig};

#[derive(Debug, Deserialize)]
struct RiskLimitsDto {
    max_drawdown_pct: String,
    daily_loss_limit_pct: String,
    max_single_position_pct: String,
    max_sector_exposure_pct: String,
    max_correlation_threshold: String,
    max_leverage: String,
    max_portfolio_risk_exposure_pct: String,
    min_position_size_pct: String,
    fractional_kelly_coeff: String,
    vol_target: String,
    vol_floor: String,
    #[serde(default = "default_max_hold_duration_secs")]
    max_hold_duration_secs: i64,
    #[serde(default = "default_monitor_interval_secs")]
    monitor_interval_secs: i64,
    #[serde(default = "default_snapshot_interval_secs")]
    snapshot_interval_secs: i64,
    #[serde(default = "default_max_price_age_secs")]
    max_price_age_secs: i64,
    #[serde(default = "default_max_close_attempts")]
    max_close_attempts: u32,
}

fn default_max_hold_duration_secs() -> i64 {
    72 * 3600
}
fn default_monitor_interval_secs() -> i64 {
    1
}
fn default_snapshot_interval_secs() -> i64 {
    60
}
fn default_max_price_age_secs() -> i64 {
    60
}
fn default_max_close_attempts() -> u32 {
    3
}

fn parse_ratio(field: &str, s: &str) -> Result<Ratio, ConfigError> {
    Ratio::from_decimal_str(s).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        reason: format!("'{s}' is not a valid decimal ratio"),
    })
}

/// Parse a `RiskLimits` from the canonical JSON of a `LoadedConfig`.
pub fn parse_risk_limits(loaded: &LoadedConfig) -> Result<RiskLimits, ConfigError> {
    let dto: RiskLimitsDto =
        serde_json::from_value(loaded.config_json.clone()).map_err(|e| ConfigError::Json {
            message: e.to_string(),
        })?;

    Ok(RiskLimits {
        max_drawdown_pct: parse_ratio("max_drawdown_pct", &dto.max_drawdown_pct)?,
        daily_loss_limit_pct: parse_ratio("daily_loss_limit_pct", &dto.daily_loss_limit_pct)?,
        max_single_position_pct: parse_ratio(
            "max_single_position_pct",
            &dto.max_single_position_pct,
        )?,
        max_sector_exposure_pct: parse_ratio(
            "max_sector_exposure_pct",
            &dto.max_sector_exposure_pct,
        )?,
        max_correlation_threshold: parse_ratio(
            "max_correlation_threshold",
            &dto.max_correlation_threshold,
        )?,
        max_leverage: parse_ratio("max_leverage", &dto.max_leverage)?,
        max_portfolio_risk_exposure_pct: parse_ratio(
            "max_portfolio_risk_exposure_pct",
            &dto.max_portfolio_risk_exposure_pct,
        )?,
        min_position_size_pct: parse_ratio("min_position_size_pct", &dto.min_position_size_pct)?,
        fractional_kelly_coeff: parse_ratio(
            "fractional_kelly_coeff",
            &dto.fractional_kelly_coeff,
        )?,
        vol_target: parse_ratio("vol_target", &dto.vol_target)?,
        vol_floor: parse_ratio("vol_floor", &dto.vol_floor)?,
        max_hold_duration: chrono::Duration::seconds(dto.max_hold_duration_secs),
        monitor_interval: chrono::Duration::seconds(dto.monitor_interval_secs),
        snapshot_interval: chrono::Duration::seconds(dto.snapshot_interval_secs),
        max_price_age: chrono::Duration::seconds(dto.max_price_age_secs),
        max_close_attempts: dto.max_close_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_layered_yaml;
    use std::io::Write;

    #[test]
    fn parses_full_risk_limits_document() {
        let mut path = std::env::temp_dir();
        path.push(format!("aegis-config-risklimits-{}.yaml", std::process::id()));
        let yaml = r#"
max_drawdown_pct: "0.15"
daily_loss_limit_pct: "0.05"
max_single_position_pct: "0.10"
max_sector_exposure_pct: "0.30"
max_correlation_threshold: "0.80"
max_leverage: "3.0"
max_portfolio_risk_exposure_pct: "0.15"
min_position_size_pct: "0.001"
fractional_kelly_coeff: "0.25"
vol_target: "0.10"
vol_floor: "0.05"
max_close_attempts: 3
"#;
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let path_str = path.to_string_lossy().to_string();

        let loaded = load_layered_yaml(&[&path_str]).unwrap();
        let limits = parse_risk_limits(&loaded).unwrap();
        assert_eq!(limits.max_drawdown_pct, Ratio::from_decimal_str("0.15").unwrap());
        assert_eq!(limits.max_close_attempts, 3);
        assert_eq!(limits.monitor_interval, chrono::Duration::seconds(1));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_non_decimal_ratio() {
        let mut path = std::env::temp_dir();
        path.push(format!("aegis-config-bad-{}.yaml", std::process::id()));
        let yaml = "max_drawdown_pct: \"not-a-number\"\ndaily_loss_limit_pct: \"0.05\"\nmax_single_position_pct: \"0.10\"\nmax_sector_exposure_pct: \"0.30\"\nmax_correlation_threshold: \"0.80\"\nmax_leverage: \"3.0\"\nmax_portfolio_risk_exposure_pct: \"0.15\"\nmin_position_size_pct: \"0.001\"\nfractional_kelly_coeff: \"0.25\"\nvol_target: \"0.10\"\nvol_floor: \"0.05\"\n";
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let path_str = path.to_string_lossy().to_string();

        let loaded = load_layered_yaml(&[&path_str]).unwrap();
        let err = parse_risk_limits(&loaded).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        std::fs::remove_file(path).ok();
    }
}
