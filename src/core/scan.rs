//! Unit scanning
//!
//! Walks the nodes of one erasable unit from a start offset. Padding nodes
//! and padding bytes are skipped. In tolerant mode a single corrupt or
//! incomplete write at the very end of the unit is accepted as the footprint
//! of a power cut; anything else is reported as corruption.

use crate::error::{RecoveryOutcome, Result};
use crate::io::Device;
use crate::node::{
    align_up, is_erased, GroupFlag, Node, NodeHeader, PadNode, ERASED_BYTE, NODE_HEADER_SIZE,
    PADDING_BYTE, PAD_NODE_SIZE,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Strict,
    /// Accept one torn write at the end of the unit
    Tolerant,
}

#[derive(Debug, Clone)]
pub struct ScannedNode {
    pub header: NodeHeader,
    pub node: Node,
    pub offs: u32,
}

impl ScannedNode {
    pub fn aligned_len(&self) -> u32 {
        align_up(self.header.len, 8)
    }
}

#[derive(Debug, Clone)]
pub struct ScannedEu {
    pub eu: u32,
    pub nodes: Vec<ScannedNode>,
    /// Offset just past the last accepted node or padding
    pub end: u32,
    /// Bytes taken by padding nodes and padding bytes
    pub pad_bytes: u32,
    pub outcome: RecoveryOutcome,
}

impl ScannedEu {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build `len` bytes of padding starting at an 8-aligned offset
pub fn padding(len: u32) -> Vec<u8> {
    if len < PAD_NODE_SIZE {
        return vec![PADDING_BYTE; len as usize];
    }
    let pad_len = len - PAD_NODE_SIZE;
    let mut bytes = Node::Pad(PadNode { pad_len }).encode(0, GroupFlag::None);
    bytes.resize(len as usize, 0);
    bytes
}

/// Pad `buf` up to the next multiple of `min_io`
pub fn pad_to(buf: &mut Vec<u8>, min_io: u32) {
    let len = buf.len() as u32;
    let gap = align_up(len, min_io) - len;
    if gap > 0 {
        buf.extend_from_slice(&padding(gap));
    }
}

/// Scan the nodes of a unit held in `buf`
pub fn scan_buf(buf: &[u8], eu: u32, start: u32, min_io: u32, mode: ScanMode) -> ScannedEu {
    let size = buf.len() as u32;
    let mut nodes = Vec::new();
    let mut pad_bytes = 0;
    let mut offs = start;

    let failure = loop {
        if offs >= size {
            break None;
        }
        let at = offs as usize;

        if buf[at] == ERASED_BYTE {
            if is_erased(&buf[at..]) {
                break None;
            }
            // An erased gap up to the next write boundary precedes a
            // head that resumed on an aligned offset
            let next = align_up(offs + 1, min_io).min(size);
            if is_erased(&buf[at..next as usize]) && next < size && buf[next as usize] != ERASED_BYTE {
                pad_bytes += next - offs;
                offs = next;
                continue;
            }
            break Some((offs, "erased bytes followed by data".to_string()));
        }

        if buf[at] == PADDING_BYTE {
            let run = buf[at..].iter().take_while(|&&b| b == PADDING_BYTE).count() as u32;
            let skip = align_up(run, 8).min(size - offs);
            pad_bytes += skip;
            offs += skip;
            continue;
        }

        match Node::decode(&buf[at..], eu, offs) {
            Ok((header, Node::Pad(pad))) => {
                let skip = align_up(header.len + pad.pad_len, 8);
                if offs + skip > size {
                    break Some((offs, format!("padding of {} bytes runs past the unit", skip)));
                }
                pad_bytes += skip;
                offs += skip;
            }
            Ok((header, node)) => {
                let len = align_up(header.len, 8);
                nodes.push(ScannedNode { header, node, offs });
                offs += len;
            }
            Err(e) => break Some((offs, e.to_string())),
        }
    };

    let mut scanned = ScannedEu {
        eu,
        nodes,
        end: offs.min(size),
        pad_bytes,
        outcome: RecoveryOutcome::Clean,
    };

    if let Some((bad, reason)) = failure {
        match mode {
            ScanMode::Strict => {
                scanned.outcome = RecoveryOutcome::Corrupted { eu, offs: bad, reason };
                return scanned;
            }
            ScanMode::Tolerant => {
                if let Some(later) = next_valid_node(buf, eu, bad + 8) {
                    scanned.outcome = RecoveryOutcome::Corrupted {
                        eu,
                        offs: bad,
                        reason: format!("{}; valid node follows at {}", reason, later),
                    };
                    return scanned;
                }
                debug!("unit {}: torn write at {} ({})", eu, bad, reason);
                scanned.end = bad;
            }
        }
    }

    // A group is only valid once its last node made it to the media
    let complete = scanned
        .nodes
        .iter()
        .rposition(|n| n.header.group != GroupFlag::InGroup)
        .map_or(0, |i| i + 1);
    if complete < scanned.nodes.len() {
        let first = scanned.nodes[complete].offs;
        if mode == ScanMode::Strict {
            scanned.outcome = RecoveryOutcome::Corrupted {
                eu,
                offs: first,
                reason: "incomplete node group".to_string(),
            };
            return scanned;
        }
        debug!(
            "unit {}: dropping {} nodes of an incomplete group at {}",
            eu,
            scanned.nodes.len() - complete,
            first
        );
        scanned.nodes.truncate(complete);
        scanned.end = first;
    }

    let written = written_end(buf);
    if written > scanned.end {
        scanned.outcome = RecoveryOutcome::TruncatedTail {
            eu,
            valid_end: scanned.end,
            dropped: written - scanned.end,
        };
    }
    scanned
}

/// Read and scan a unit
pub fn scan_eu(dev: &dyn Device, eu: u32, start: u32, mode: ScanMode, retries: u32) -> Result<ScannedEu> {
    let buf = crate::io::read_eu(dev, eu, retries)?;
    let min_io = dev.geometry().min_io_size;
    Ok(scan_buf(&buf, eu, start, min_io, mode))
}

/// Rewrite a unit so it ends right after `valid_end`
///
/// The kept prefix is padded to the write boundary and the unit replaced
/// atomically. Returns the new end offset.
pub fn truncate_eu(dev: &dyn Device, eu: u32, valid_end: u32, retries: u32) -> Result<u32> {
    let min_io = dev.geometry().min_io_size;
    let mut buf = crate::io::read_eu(dev, eu, retries)?;
    buf.truncate(valid_end as usize);
    pad_to(&mut buf, min_io);
    dev.change(eu, &buf)?;
    warn!("unit {} truncated to {} bytes", eu, buf.len());
    Ok(buf.len() as u32)
}

fn written_end(buf: &[u8]) -> u32 {
    buf.iter()
        .rposition(|&b| b != ERASED_BYTE)
        .map_or(0, |p| align_up(p as u32 + 1, 8))
}

fn next_valid_node(buf: &[u8], eu: u32, from: u32) -> Option<u32> {
    let mut offs = align_up(from, 8);
    while offs as usize + NODE_HEADER_SIZE as usize <= buf.len() {
        let at = offs as usize;
        if let Ok(header) = NodeHeader::parse(&buf[at..], eu, offs) {
            if header.verify(&buf[at..], eu, offs).is_ok() {
                return Some(offs);
            }
        }
        offs += 8;
    }
    None
}
