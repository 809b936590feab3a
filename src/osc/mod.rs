//! OSC wire surface.
//!
//! Address parsing and message building for the three-message contract:
//! `/ppg/{id}` sample bundles in, `/reset/{id}` control in, `/beat/{id}`
//! out. Everything here is pure; the sockets live in [`ingress`] and
//! [`egress`].

pub mod egress;
pub mod ingress;

pub use egress::BeatEgress;
pub use ingress::OscIngress;

use rosc::{OscMessage, OscPacket, OscType};

use crate::analysis::BeatEvent;
use crate::error::TransportError;
use crate::pipeline::SampleBundle;
use crate::tunables::{BUNDLE_SAMPLES, SENSOR_SLOTS};

/// One decoded inbound item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Bundle(SampleBundle),
    Reset(u8),
}

/// Walk a decoded packet (OSC bundles may nest) and collect everything that
/// matches the wire contract. Unknown addresses are skipped silently; a
/// matching address with bad arguments is an error so the caller can log
/// the drop.
pub fn parse_packet(packet: OscPacket) -> Result<Vec<Inbound>, TransportError> {
    let mut items = Vec::new();
    collect(packet, &mut items)?;
    Ok(items)
}

fn collect(packet: OscPacket, items: &mut Vec<Inbound>) -> Result<(), TransportError> {
    match packet {
        OscPacket::Message(msg) => {
            if let Some(item) = parse_message(msg)? {
                items.push(item);
            }
        }
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                collect(inner, items)?;
            }
        }
    }
    Ok(())
}

fn parse_message(msg: OscMessage) -> Result<Option<Inbound>, TransportError> {
    if let Some(rest) = msg.addr.strip_prefix("/ppg/") {
        let id = parse_sensor_id(&msg.addr, rest)?;
        let bundle = parse_bundle_args(&msg)?;
        return Ok(Some(Inbound::Bundle(SampleBundle {
            ppg_id: id,
            samples: bundle.0,
            device_ms: bundle.1,
        })));
    }
    if let Some(rest) = msg.addr.strip_prefix("/reset/") {
        let id = parse_sensor_id(&msg.addr, rest)?;
        return Ok(Some(Inbound::Reset(id)));
    }
    Ok(None)
}

fn parse_sensor_id(addr: &str, rest: &str) -> Result<u8, TransportError> {
    let id: u8 = rest.parse().map_err(|_| TransportError::Malformed {
        addr: addr.to_string(),
        details: format!("sensor id {:?} is not an integer", rest),
    })?;
    if (id as usize) >= SENSOR_SLOTS {
        return Err(TransportError::Malformed {
            addr: addr.to_string(),
            details: format!("sensor id {} out of range 0..{}", id, SENSOR_SLOTS),
        });
    }
    Ok(id)
}

fn parse_bundle_args(msg: &OscMessage) -> Result<([i32; BUNDLE_SAMPLES], i64), TransportError> {
    if msg.args.len() != BUNDLE_SAMPLES + 1 {
        return Err(TransportError::Malformed {
            addr: msg.addr.clone(),
            details: format!("expected {} int args, got {}", BUNDLE_SAMPLES + 1, msg.args.len()),
        });
    }
    let mut ints = [0i64; BUNDLE_SAMPLES + 1];
    for (slot, arg) in ints.iter_mut().zip(&msg.args) {
        *slot = int_arg(arg).ok_or_else(|| TransportError::Malformed {
            addr: msg.addr.clone(),
            details: format!("non-integer argument {:?}", arg),
        })?;
    }
    let mut samples = [0i32; BUNDLE_SAMPLES];
    for (slot, &value) in samples.iter_mut().zip(&ints[..BUNDLE_SAMPLES]) {
        // Range validation happens in the pipeline; the wire layer only
        // needs the value to fit the sample type.
        *slot = value.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    }
    Ok((samples, ints[BUNDLE_SAMPLES]))
}

fn int_arg(arg: &OscType) -> Option<i64> {
    match arg {
        OscType::Int(v) => Some(*v as i64),
        OscType::Long(v) => Some(*v),
        _ => None,
    }
}

/// Build a `/ppg/{id}` message (replay and synth senders).
pub fn ppg_message(ppg_id: u8, samples: &[i32; BUNDLE_SAMPLES], device_ms: i64) -> OscPacket {
    let mut args: Vec<OscType> = samples.iter().map(|&s| OscType::Int(s)).collect();
    args.push(OscType::Long(device_ms));
    OscPacket::Message(OscMessage {
        addr: format!("/ppg/{}", ppg_id),
        args,
    })
}

/// Build a `/beat/{id}` message.
///
/// The timestamp goes out as an OSC double: a single-precision float at
/// unix-epoch magnitude quantizes to ~128 s, far outside the ±200 ms
/// delivery contract.
pub fn beat_message(beat: &BeatEvent) -> OscPacket {
    OscPacket::Message(OscMessage {
        addr: format!("/beat/{}", beat.ppg_id),
        args: vec![
            OscType::Double(beat.t_unix_s),
            OscType::Float(beat.bpm as f32),
            OscType::Float(beat.intensity as f32),
        ],
    })
}
