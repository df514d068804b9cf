//! Meter value synthesis and the per-connector sampler task.
//!
//! All electrical values are synthesised; nothing is measured. Each
//! tick consults the connector's MeterValues template and produces one
//! MeterValues request carrying the aggregate and per-phase samples.

use crate::station::Station;
use crate::template::{PowerOutType, SampledValueTemplate};
use evsim_types::v16::{Measurand, MeterValue, Phase, SampledValue, UnitOfMeasure};
use evsim_types::{OcppError, OcppResult};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Everything the synthesis step needs to know about the station.
#[derive(Debug, Clone)]
pub(crate) struct SamplingContext {
    pub station_id: String,
    /// Station maximum power in W, before divider
    pub max_power: f64,
    /// Number of connectors, or of running transactions when power is
    /// shared; must be ≥ 1 for any sampling to happen
    pub power_divider: u32,
    pub number_of_phases: u32,
    pub voltage_out: f64,
    pub power_out_type: PowerOutType,
    /// Measurand names declared in the MeterValuesSampledData key
    pub declared: HashSet<String>,
    pub interval: Duration,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn phase_to_neutral(n: u32) -> Phase {
    match n {
        1 => Phase::L1N,
        2 => Phase::L2N,
        _ => Phase::L3N,
    }
}

fn phase_to_phase(n: u32) -> Phase {
    match n {
        1 => Phase::L1L2,
        2 => Phase::L2L3,
        _ => Phase::L3L1,
    }
}

fn phase_line(n: u32) -> Phase {
    match n {
        1 => Phase::L1,
        2 => Phase::L2,
        _ => Phase::L3,
    }
}

/// Synthesise the sampled values for one metering tick.
///
/// `energy_register` is the connector's running
/// Energy.Active.Import.Register in Wh and is advanced in place.
pub(crate) fn synthesize_sampled_values(
    ctx: &SamplingContext,
    templates: &[SampledValueTemplate],
    energy_register: &mut i64,
) -> OcppResult<Vec<SampledValue>> {
    if ctx.power_divider == 0 {
        return Err(OcppError::generic(
            "power divider is zero, cannot scale sampled values",
        ));
    }

    let divider = ctx.power_divider as f64;
    let station_power = ctx.max_power / divider;
    let interval_ms = ctx.interval.as_millis() as f64;
    let mut rng = rand::thread_rng();
    let mut samples = Vec::new();

    for entry in templates {
        let measurand = entry.measurand.unwrap_or(Measurand::EnergyActiveImportRegister);
        if !ctx.declared.contains(measurand.as_str()) {
            debug!(
                "{}: measurand {} not in MeterValuesSampledData, skipping",
                ctx.station_id,
                measurand.as_str()
            );
            continue;
        }

        match measurand {
            Measurand::EnergyActiveImportRegister => {
                let unit = entry.unit.unwrap_or(UnitOfMeasure::Wh);
                if let Some(value) = &entry.value {
                    samples.push(sample(entry, value.clone(), measurand, unit, None));
                    continue;
                }
                let max_delta = ctx.max_power / (divider * 3_600_000.0) * interval_ms;
                let delta = rng.gen_range(0.0..=max_delta.max(0.0)).round() as i64;
                let cap = (ctx.max_power * 3600.0 / (divider * interval_ms)).round() as i64;
                if delta > cap {
                    warn!(
                        "{}: energy delta {delta} Wh exceeds per-interval maximum {cap} Wh",
                        ctx.station_id
                    );
                }
                if *energy_register < 0 {
                    *energy_register = 0;
                }
                *energy_register += delta;
                samples.push(sample(entry, energy_register.to_string(), measurand, unit, None));
            }
            Measurand::PowerActiveImport => {
                let unit = entry.unit.unwrap_or(UnitOfMeasure::W);
                if let Some(value) = &entry.value {
                    samples.push(sample(entry, value.clone(), measurand, unit, None));
                    continue;
                }
                match (ctx.power_out_type, ctx.number_of_phases) {
                    (PowerOutType::AC, 3) => {
                        let per_phase = station_power / 3.0;
                        let phases: Vec<f64> = (0..3)
                            .map(|_| round2(rng.gen_range(0.0..=per_phase)))
                            .collect();
                        let all = round2(phases.iter().sum());
                        samples.push(sample(entry, format_value(all), measurand, unit, None));
                        for (n, value) in phases.iter().enumerate() {
                            samples.push(sample(
                                entry,
                                format_value(*value),
                                measurand,
                                unit,
                                Some(phase_to_neutral(n as u32 + 1)),
                            ));
                        }
                    }
                    (PowerOutType::AC, _) => {
                        let l1 = round2(rng.gen_range(0.0..=station_power));
                        samples.push(sample(entry, format_value(l1), measurand, unit, None));
                        samples.push(sample(
                            entry,
                            format_value(l1),
                            measurand,
                            unit,
                            Some(Phase::L1N),
                        ));
                    }
                    (PowerOutType::DC, _) => {
                        let all = round2(rng.gen_range(0.0..=station_power));
                        samples.push(sample(entry, format_value(all), measurand, unit, None));
                    }
                }
            }
            Measurand::CurrentImport => {
                let unit = entry.unit.unwrap_or(UnitOfMeasure::A);
                if let Some(value) = &entry.value {
                    samples.push(sample(entry, value.clone(), measurand, unit, None));
                    continue;
                }
                let max_amperage = match ctx.power_out_type {
                    PowerOutType::AC => {
                        station_power / (ctx.number_of_phases.max(1) as f64 * ctx.voltage_out)
                    }
                    PowerOutType::DC => station_power / ctx.voltage_out,
                };
                match (ctx.power_out_type, ctx.number_of_phases) {
                    (PowerOutType::AC, 3) => {
                        let currents: Vec<f64> = (0..3)
                            .map(|_| round2(rng.gen_range(0.0..=max_amperage)))
                            .collect();
                        let mean = round2(currents.iter().sum::<f64>() / 3.0);
                        samples.push(sample(entry, format_value(mean), measurand, unit, None));
                        for (n, value) in currents.iter().enumerate() {
                            samples.push(sample(
                                entry,
                                format_value(*value),
                                measurand,
                                unit,
                                Some(phase_line(n as u32 + 1)),
                            ));
                        }
                    }
                    (PowerOutType::AC, _) => {
                        let l1 = round2(rng.gen_range(0.0..=max_amperage));
                        samples.push(sample(entry, format_value(l1), measurand, unit, None));
                        samples.push(sample(
                            entry,
                            format_value(l1),
                            measurand,
                            unit,
                            Some(Phase::L1),
                        ));
                    }
                    (PowerOutType::DC, _) => {
                        let all = round2(rng.gen_range(0.0..=max_amperage));
                        samples.push(sample(entry, format_value(all), measurand, unit, None));
                    }
                }
            }
            Measurand::Voltage => {
                let unit = entry.unit.unwrap_or(UnitOfMeasure::V);
                if let Some(value) = &entry.value {
                    samples.push(sample(entry, value.clone(), measurand, unit, None));
                    continue;
                }
                let nominal = ctx.voltage_out;
                let voltage = round2(rng.gen_range(0.9 * nominal..=1.1 * nominal));
                samples.push(sample(entry, format_value(voltage), measurand, unit, None));
                if ctx.number_of_phases == 3 {
                    for n in 1..=3 {
                        let phase_voltage =
                            round2(rng.gen_range(0.9 * nominal..=1.1 * nominal));
                        let phase = if nominal <= 250.0 {
                            phase_to_neutral(n)
                        } else {
                            phase_to_phase(n)
                        };
                        samples.push(sample(
                            entry,
                            format_value(phase_voltage),
                            measurand,
                            unit,
                            Some(phase),
                        ));
                    }
                }
            }
            Measurand::StateOfCharge => {
                let unit = entry.unit.unwrap_or(UnitOfMeasure::Percent);
                let value = match &entry.value {
                    Some(value) => {
                        if value.parse::<f64>().map(|soc| soc > 100.0).unwrap_or(false) {
                            warn!(
                                "{}: template SoC value {value} exceeds 100 percent",
                                ctx.station_id
                            );
                        }
                        value.clone()
                    }
                    None => rng.gen_range(0..=100).to_string(),
                };
                samples.push(sample(entry, value, measurand, unit, None));
            }
            other => {
                // no synthesis rule; a template-fixed value still passes through
                match &entry.value {
                    Some(value) => {
                        let unit = entry.unit.unwrap_or(UnitOfMeasure::W);
                        samples.push(sample(entry, value.clone(), other, unit, None));
                    }
                    None => warn!(
                        "{}: no synthesis rule for measurand {}, skipping",
                        ctx.station_id,
                        other.as_str()
                    ),
                }
            }
        }
    }

    Ok(samples)
}

fn format_value(value: f64) -> String {
    // trim trailing zeros the way a meter firmware would print
    let text = format!("{value:.2}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn sample(
    entry: &SampledValueTemplate,
    value: String,
    measurand: Measurand,
    unit: UnitOfMeasure,
    phase: Option<Phase>,
) -> SampledValue {
    SampledValue {
        value,
        context: entry.context,
        format: None,
        measurand: Some(measurand),
        phase,
        location: None,
        unit: Some(unit),
    }
}

/// Wrap synthesised samples into a timestamped MeterValue batch.
pub(crate) fn meter_value(samples: Vec<SampledValue>) -> MeterValue {
    MeterValue {
        timestamp: chrono::Utc::now(),
        sampled_value: samples,
    }
}

/// Spawn the per-connector sampler task. A failing tick is reported and
/// the timer keeps running.
pub(crate) fn spawn_sampler(
    station: &Arc<Station>,
    connector_id: u32,
    interval: Duration,
) -> JoinHandle<()> {
    let station = Arc::clone(station);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the zeroth tick completes immediately; samples start one
        // interval into the transaction
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(error) = station.sample_connector(connector_id, interval).await {
                error!(
                    "{}: meter sampling on connector {connector_id} failed: {error}",
                    station.station_id()
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared_all() -> HashSet<String> {
        [
            "Energy.Active.Import.Register",
            "Power.Active.Import",
            "Current.Import",
            "Voltage",
            "SoC",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn ctx() -> SamplingContext {
        SamplingContext {
            station_id: "CS-TEST-0000".to_string(),
            max_power: 7360.0,
            power_divider: 1,
            number_of_phases: 3,
            voltage_out: 230.0,
            power_out_type: PowerOutType::AC,
            declared: declared_all(),
            interval: Duration::from_secs(60),
        }
    }

    fn entry(measurand: Measurand) -> SampledValueTemplate {
        SampledValueTemplate {
            measurand: Some(measurand),
            unit: None,
            context: None,
            value: None,
        }
    }

    #[test]
    fn zero_divider_fails_the_tick() {
        let mut ctx = ctx();
        ctx.power_divider = 0;
        let mut register = 0;
        let result = synthesize_sampled_values(
            &ctx,
            &[entry(Measurand::EnergyActiveImportRegister)],
            &mut register,
        );
        assert!(result.is_err());
    }

    #[test]
    fn energy_register_initialises_and_accumulates() {
        let ctx = ctx();
        let templates = [entry(Measurand::EnergyActiveImportRegister)];
        let mut register = crate::connector::ENERGY_REGISTER_UNSET;

        let samples = synthesize_sampled_values(&ctx, &templates, &mut register).unwrap();
        assert_eq!(samples.len(), 1);
        assert!(register >= 0);
        let first = register;
        // max delta for 7.36 kW over 60 s is ~123 Wh
        assert!(first <= 123);

        let samples = synthesize_sampled_values(&ctx, &templates, &mut register).unwrap();
        assert!(register >= first);
        assert_eq!(samples[0].value, register.to_string());
        assert_eq!(samples[0].unit, Some(UnitOfMeasure::Wh));
    }

    #[test]
    fn template_value_overrides_energy_synthesis() {
        let ctx = ctx();
        let mut template = entry(Measurand::EnergyActiveImportRegister);
        template.value = Some("12345".to_string());
        let mut register = 100;

        let samples = synthesize_sampled_values(&ctx, &[template], &mut register).unwrap();
        assert_eq!(samples[0].value, "12345");
        assert_eq!(register, 100);
    }

    #[test]
    fn absent_measurand_defaults_to_energy() {
        let ctx = ctx();
        let template = SampledValueTemplate {
            measurand: None,
            unit: None,
            context: None,
            value: None,
        };
        let mut register = 0;
        let samples = synthesize_sampled_values(&ctx, &[template], &mut register).unwrap();
        assert_eq!(
            samples[0].measurand,
            Some(Measurand::EnergyActiveImportRegister)
        );
    }

    #[test]
    fn three_phase_power_emits_aggregate_plus_phases() {
        let ctx = ctx();
        let mut register = 0;
        let samples =
            synthesize_sampled_values(&ctx, &[entry(Measurand::PowerActiveImport)], &mut register)
                .unwrap();

        assert_eq!(samples.len(), 4);
        assert!(samples[0].phase.is_none());
        assert_eq!(samples[1].phase, Some(Phase::L1N));
        assert_eq!(samples[2].phase, Some(Phase::L2N));
        assert_eq!(samples[3].phase, Some(Phase::L3N));
        assert_eq!(samples[0].unit, Some(UnitOfMeasure::W));

        let aggregate: f64 = samples[0].value.parse().unwrap();
        let sum: f64 = samples[1..]
            .iter()
            .map(|s| s.value.parse::<f64>().unwrap())
            .sum();
        assert!((aggregate - sum).abs() < 0.05);
    }

    #[test]
    fn dc_power_emits_aggregate_only() {
        let mut ctx = ctx();
        ctx.power_out_type = PowerOutType::DC;
        let mut register = 0;
        let samples =
            synthesize_sampled_values(&ctx, &[entry(Measurand::PowerActiveImport)], &mut register)
                .unwrap();
        assert_eq!(samples.len(), 1);
        assert!(samples[0].phase.is_none());
    }

    #[test]
    fn three_phase_current_aggregate_is_phase_mean() {
        let ctx = ctx();
        let mut register = 0;
        let samples =
            synthesize_sampled_values(&ctx, &[entry(Measurand::CurrentImport)], &mut register)
                .unwrap();

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[1].phase, Some(Phase::L1));
        assert_eq!(samples[2].phase, Some(Phase::L2));
        assert_eq!(samples[3].phase, Some(Phase::L3));

        let mean: f64 = samples[0].value.parse().unwrap();
        let expected: f64 = samples[1..]
            .iter()
            .map(|s| s.value.parse::<f64>().unwrap())
            .sum::<f64>()
            / 3.0;
        assert!((mean - expected).abs() < 0.05);

        // per-phase current never exceeds P / (phases * V)
        let max_amperage = 7360.0 / (3.0 * 230.0);
        for phase_sample in &samples[1..] {
            assert!(phase_sample.value.parse::<f64>().unwrap() <= max_amperage + 0.01);
        }
    }

    #[test]
    fn voltage_stays_within_ten_percent_band() {
        let ctx = ctx();
        let mut register = 0;
        for _ in 0..10 {
            let samples =
                synthesize_sampled_values(&ctx, &[entry(Measurand::Voltage)], &mut register)
                    .unwrap();
            // aggregate plus one per phase on a 3-phase station
            assert_eq!(samples.len(), 4);
            for s in &samples {
                let v: f64 = s.value.parse().unwrap();
                assert!((207.0..=253.0).contains(&v), "voltage {v} out of band");
            }
            assert_eq!(samples[1].phase, Some(Phase::L1N));
        }
    }

    #[test]
    fn high_voltage_uses_phase_to_phase_labels() {
        let mut ctx = ctx();
        ctx.voltage_out = 400.0;
        let mut register = 0;
        let samples =
            synthesize_sampled_values(&ctx, &[entry(Measurand::Voltage)], &mut register).unwrap();
        assert_eq!(samples[1].phase, Some(Phase::L1L2));
        assert_eq!(samples[2].phase, Some(Phase::L2L3));
        assert_eq!(samples[3].phase, Some(Phase::L3L1));
    }

    #[test]
    fn soc_is_capped_at_one_hundred() {
        let ctx = ctx();
        let mut register = 0;
        for _ in 0..20 {
            let samples = synthesize_sampled_values(
                &ctx,
                &[entry(Measurand::StateOfCharge)],
                &mut register,
            )
            .unwrap();
            let soc: f64 = samples[0].value.parse().unwrap();
            assert!((0.0..=100.0).contains(&soc));
            assert_eq!(samples[0].unit, Some(UnitOfMeasure::Percent));
        }
    }

    #[test]
    fn undeclared_measurand_is_skipped() {
        let mut ctx = ctx();
        ctx.declared = ["Energy.Active.Import.Register".to_string()]
            .into_iter()
            .collect();
        let mut register = 0;
        let samples = synthesize_sampled_values(
            &ctx,
            &[
                entry(Measurand::PowerActiveImport),
                entry(Measurand::EnergyActiveImportRegister),
            ],
            &mut register,
        )
        .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(
            samples[0].measurand,
            Some(Measurand::EnergyActiveImportRegister)
        );
    }

    #[test]
    fn power_divider_scales_the_synthesis() {
        let mut ctx = ctx();
        ctx.power_divider = 2;
        let mut register = 0;
        for _ in 0..10 {
            let samples = synthesize_sampled_values(
                &ctx,
                &[entry(Measurand::PowerActiveImport)],
                &mut register,
            )
            .unwrap();
            let aggregate: f64 = samples[0].value.parse().unwrap();
            assert!(aggregate <= 7360.0 / 2.0 + 0.01);
        }
    }
}
