//! `frame` and `eth` layers.

use chrono::{DateTime, Utc};

use super::contract::{epoch, integer, mac, text, Contract};
use crate::model::MacAddr;

/// Capture metadata tshark attaches to every packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayer {
    pub number: u64,
    pub time: Option<DateTime<Utc>>,
    pub len: u32,
    pub cap_len: u32,
    /// Protocol stack, outermost first (`eth`, `ethertype`, `ip`, ...).
    pub protocols: Vec<String>,
}

pub fn frame_contract() -> Contract<FrameLayer> {
    Contract::new("frame")
        .plain("frame.number", |f: &mut FrameLayer, v| {
            f.number = integer(v, "frame.number")?;
            Ok(())
        })
        .plain("frame.time_epoch", |f: &mut FrameLayer, v| {
            f.time = Some(epoch(v, "frame.time_epoch")?);
            Ok(())
        })
        .plain("frame.len", |f: &mut FrameLayer, v| {
            f.len = integer(v, "frame.len")?;
            Ok(())
        })
        .plain("frame.cap_len", |f: &mut FrameLayer, v| {
            f.cap_len = integer(v, "frame.cap_len")?;
            Ok(())
        })
        .plain("frame.protocols", |f: &mut FrameLayer, v| {
            f.protocols = text(v, "frame.protocols")?
                .split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect();
            Ok(())
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EthLayer {
    pub dst: Option<MacAddr>,
    pub src: Option<MacAddr>,
    pub ethertype: u16,
}

pub fn eth_contract() -> Contract<EthLayer> {
    Contract::new("eth")
        .plain("eth.dst", |e: &mut EthLayer, v| {
            e.dst = Some(mac(v, "eth.dst")?);
            Ok(())
        })
        .plain("eth.src", |e: &mut EthLayer, v| {
            e.src = Some(mac(v, "eth.src")?);
            Ok(())
        })
        .plain("eth.type", |e: &mut EthLayer, v| {
            e.ethertype = integer(v, "eth.type")?;
            Ok(())
        })
}
