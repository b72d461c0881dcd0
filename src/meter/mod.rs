//! Meter sampler
//!
//! One periodic task per transacting connector. Every tick walks the
//! connector's `MeterValues` template, synthesises the sampled values the
//! `MeterValuesSampledData` configuration key declares, and ships them as
//! a single MeterValues request. Errors are confined to the tick: a
//! failed sample is logged and the timer keeps running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_ocpp::v1_6::types::{
    Measurand, MeterValue, Phase, SampledValue, UnitOfMeasure,
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::config::{PowerOutType, SampledValueTemplate, StationInfo};
use crate::ocpp::requests;
use crate::station::connectors::power_divider;
use crate::station::Station;
use crate::support::errors::{ErrorCode, OcppError};

/// Threshold above which per-phase voltages are reported phase-to-phase
/// instead of phase-to-neutral.
const PHASE_TO_PHASE_VOLTAGE_THRESHOLD: f64 = 250.0;

/// Spawn the sampler for `connector_id` and park its handle on the
/// connector record. Any previous sampler is cancelled first.
pub(crate) fn start_sampler(station: &Arc<Station>, connector_id: u32) {
    let interval = station.meter_value_sample_interval();
    let handle = tokio::spawn(sampler_loop(station.clone(), connector_id, interval));
    let mut connectors = station.lock_connectors();
    match connectors.get_mut(connector_id) {
        Some(connector) => {
            connector.stop_sampler();
            connector.sampler = Some(handle);
        }
        None => handle.abort(),
    }
}

async fn sampler_loop(station: Arc<Station>, connector_id: u32, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the first sample should land
    // one full period after the transaction started.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = sample_once(&station, connector_id, interval).await {
            error!(
                station_id = station.id(),
                connector_id,
                error = %err,
                "MeterValues sampling tick failed"
            );
        }
    }
}

async fn sample_once(
    station: &Arc<Station>,
    connector_id: u32,
    interval: Duration,
) -> Result<(), OcppError> {
    let info = station.read_info();
    let declared = {
        let config = station.lock_config();
        config.sampled_data_measurands()
    };

    let (samples, transaction_id) = {
        let mut connectors = station.lock_connectors();
        let divider = power_divider(&connectors, &info);
        let connector = connectors.get_mut(connector_id).ok_or_else(|| {
            OcppError::generic(format!("Connector {} does not exist", connector_id))
        })?;
        if !connector.transaction_started {
            return Ok(());
        }
        if divider < 1 {
            return Err(OcppError::new(
                ErrorCode::InternalError,
                format!("Power divider is {}, cannot sample", divider),
            ));
        }
        let templates = connector.meter_values.clone();
        let samples = build_connector_samples(
            station.id(),
            connector_id,
            &info,
            divider,
            interval,
            &templates,
            &declared,
            &mut connector.last_energy_register_wh,
        );
        (samples, connector.transaction_id)
    };

    if samples.is_empty() {
        return Ok(());
    }

    let meter_value = MeterValue {
        timestamp: Utc::now(),
        sampled_value: samples,
    };
    requests::send_meter_values(station, connector_id, transaction_id, vec![meter_value]).await
}

/// Synthesise the sampled values for one tick. `register_wh` is the
/// connector's running Energy.Active.Import.Register accumulator and is
/// advanced in place.
#[allow(clippy::too_many_arguments)]
fn build_connector_samples(
    station_id: &str,
    connector_id: u32,
    info: &StationInfo,
    divider: u32,
    interval: Duration,
    templates: &[SampledValueTemplate],
    declared: &[String],
    register_wh: &mut i64,
) -> Vec<SampledValue> {
    let mut samples = Vec::new();
    let interval_ms = interval.as_millis().max(1) as f64;
    // Power available to this connector.
    let connector_power = info.max_power / divider as f64;
    let three_phase_ac =
        info.power_out_type == PowerOutType::AC && info.number_of_phases == 3;

    for template in templates {
        let measurand = template
            .measurand
            .clone()
            .unwrap_or(Measurand::EnergyActiveImportRegister);
        let name = measurand_wire_name(&measurand);
        if !declared.iter().any(|declared_name| declared_name == &name) {
            debug!(
                station_id,
                connector_id,
                measurand = name.as_str(),
                "Measurand not in MeterValuesSampledData, skipped"
            );
            continue;
        }

        let mut rng = rand::thread_rng();
        match measurand {
            Measurand::EnergyActiveImportRegister => {
                let consumed_wh = match fixed_value(template) {
                    Some(fixed) => fixed,
                    None => {
                        if *register_wh < 0 {
                            *register_wh = 0;
                        }
                        let max_delta =
                            info.max_power / (divider as f64 * 3_600_000.0) * interval_ms;
                        let delta = rng.gen_range(0.0..=max_delta.max(0.0)).round() as i64;
                        *register_wh += delta;
                        delta as f64
                    }
                };
                let max_interval_consumption =
                    (info.max_power * 3600.0 / (divider as f64 * interval_ms)).round();
                if consumed_wh > max_interval_consumption {
                    error!(
                        station_id,
                        connector_id,
                        consumed_wh,
                        max_interval_consumption,
                        "Energy register increment above the per-interval maximum"
                    );
                }
                let value = match fixed_value(template) {
                    Some(fixed) => format_value(fixed),
                    None => register_wh.to_string(),
                };
                samples.push(build_sample(
                    template,
                    measurand.clone(),
                    UnitOfMeasure::Wh,
                    value,
                    None,
                ));
            }
            Measurand::PowerActiveImport => {
                if three_phase_ac {
                    let per_phase_max = connector_power / 3.0;
                    let phases: Vec<f64> = (0..3)
                        .map(|_| round2(rng.gen_range(0.0..=per_phase_max.max(0.0))))
                        .collect();
                    let all_phases = round2(phases.iter().sum());
                    samples.push(build_sample(
                        template,
                        measurand.clone(),
                        UnitOfMeasure::W,
                        format_value(all_phases),
                        None,
                    ));
                    for (index, value) in phases.iter().enumerate() {
                        samples.push(build_sample(
                            template,
                            measurand.clone(),
                            UnitOfMeasure::W,
                            format_value(*value),
                            Some(phase_to_neutral(index)),
                        ));
                    }
                } else {
                    let all_phases = round2(rng.gen_range(0.0..=connector_power.max(0.0)));
                    samples.push(build_sample(
                        template,
                        measurand.clone(),
                        UnitOfMeasure::W,
                        format_value(all_phases),
                        None,
                    ));
                }
            }
            Measurand::CurrentImport => {
                let max_amperage = match info.power_out_type {
                    PowerOutType::AC => {
                        connector_power
                            / (info.voltage_out * info.number_of_phases.max(1) as f64)
                    }
                    PowerOutType::DC => connector_power / info.voltage_out,
                };
                if three_phase_ac {
                    let phases: Vec<f64> = (0..3)
                        .map(|_| round2(rng.gen_range(0.0..=max_amperage.max(0.0))))
                        .collect();
                    let mean = round2(phases.iter().sum::<f64>() / 3.0);
                    samples.push(build_sample(
                        template,
                        measurand.clone(),
                        UnitOfMeasure::A,
                        format_value(mean),
                        None,
                    ));
                    for (index, value) in phases.iter().enumerate() {
                        samples.push(build_sample(
                            template,
                            measurand.clone(),
                            UnitOfMeasure::A,
                            format_value(*value),
                            Some(bare_phase(index)),
                        ));
                    }
                } else {
                    let value = round2(rng.gen_range(0.0..=max_amperage.max(0.0)));
                    samples.push(build_sample(
                        template,
                        measurand.clone(),
                        UnitOfMeasure::A,
                        format_value(value),
                        None,
                    ));
                }
            }
            Measurand::Voltage => {
                let nominal = info.voltage_out;
                let voltage = round2(rng.gen_range(0.9 * nominal..=1.1 * nominal));
                samples.push(build_sample(
                    template,
                    measurand.clone(),
                    UnitOfMeasure::V,
                    format_value(voltage),
                    None,
                ));
                if three_phase_ac {
                    for index in 0..3 {
                        let phase_voltage =
                            round2(rng.gen_range(0.9 * nominal..=1.1 * nominal));
                        let phase = if nominal <= PHASE_TO_PHASE_VOLTAGE_THRESHOLD {
                            phase_to_neutral(index)
                        } else {
                            phase_to_phase(index)
                        };
                        samples.push(build_sample(
                            template,
                            measurand.clone(),
                            UnitOfMeasure::V,
                            format_value(phase_voltage),
                            Some(phase),
                        ));
                    }
                }
            }
            Measurand::SoC => {
                let soc = match fixed_value(template) {
                    Some(fixed) => fixed,
                    None => rng.gen_range(0..=100) as f64,
                };
                if soc > 100.0 {
                    error!(
                        station_id,
                        connector_id, soc, "SoC sample above 100 percent"
                    );
                }
                samples.push(build_sample(
                    template,
                    measurand.clone(),
                    UnitOfMeasure::Percent,
                    format_value(soc),
                    None,
                ));
            }
            other => {
                warn!(
                    station_id,
                    connector_id,
                    measurand = ?other,
                    "Unsupported measurand in MeterValues template, skipped"
                );
            }
        }
    }

    samples
}

fn build_sample(
    template: &SampledValueTemplate,
    measurand: Measurand,
    default_unit: UnitOfMeasure,
    value: String,
    phase: Option<Phase>,
) -> SampledValue {
    SampledValue {
        value,
        context: template.context.clone(),
        format: None,
        measurand: Some(measurand),
        phase,
        location: template.location.clone(),
        unit: Some(template.unit.clone().unwrap_or(default_unit)),
    }
}

fn fixed_value(template: &SampledValueTemplate) -> Option<f64> {
    template.value.as_deref().and_then(|raw| raw.trim().parse().ok())
}

fn measurand_wire_name(measurand: &Measurand) -> String {
    serde_json::to_value(measurand)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn phase_to_neutral(index: usize) -> Phase {
    match index {
        0 => Phase::L1N,
        1 => Phase::L2N,
        _ => Phase::L3N,
    }
}

fn bare_phase(index: usize) -> Phase {
    match index {
        0 => Phase::L1,
        1 => Phase::L2,
        _ => Phase::L3,
    }
}

/// `L{n}-L{(n mod 3)+1}` pairing for phase-to-phase voltage samples.
fn phase_to_phase(index: usize) -> Phase {
    match index {
        0 => Phase::L1L2,
        1 => Phase::L2L3,
        _ => Phase::L3L1,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn format_value(value: f64) -> String {
    if (value.fract()).abs() < f64::EPSILON {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}
