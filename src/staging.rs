//! Host-visible staging for pipelined readback, plus a small input-texture
//! pool for streaming workloads.
//!
//! A detect call copies its keypoint and descriptor results into the staging
//! slot `frame % depth` and requests the (non-blocking) async map right
//! away; the map is awaited only by the frame that consumes the slot, which
//! hides map latency at the cost of one frame of extra result latency.
//! Re-using a slot whose map was never awaited is a driver bug and is
//! reported as `BadConfig` rather than silently stalling.

use std::sync::mpsc;

use crate::error::{Result, SiftError};

/// Pure slot-state bookkeeping, separated from the GPU buffers so the
/// re-use-before-await protocol is testable without a device.
#[derive(Debug)]
pub(crate) struct RingState {
    states: Vec<SlotState>,
    frame: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    Free,
    InFlight,
}

impl RingState {
    pub(crate) fn new(depth: usize) -> Result<Self> {
        if depth < 3 {
            return Err(SiftError::BadConfig(format!(
                "staging ring depth must be >= 3, got {depth}"
            )));
        }
        Ok(RingState {
            states: vec![SlotState::Free; depth],
            frame: 0,
        })
    }

    /// Slot the current frame writes to.
    pub(crate) fn current(&self) -> usize {
        (self.frame % self.states.len() as u64) as usize
    }

    pub(crate) fn acquire(&mut self) -> Result<usize> {
        let slot = self.current();
        if self.states[slot] != SlotState::Free {
            return Err(SiftError::BadConfig(format!(
                "staging slot {slot} re-used before its map was awaited"
            )));
        }
        Ok(slot)
    }

    pub(crate) fn mark_in_flight(&mut self, slot: usize) {
        self.states[slot] = SlotState::InFlight;
        self.frame += 1;
    }

    pub(crate) fn mark_consumed(&mut self, slot: usize) {
        self.states[slot] = SlotState::Free;
    }

    pub(crate) fn is_in_flight(&self, slot: usize) -> bool {
        self.states[slot] == SlotState::InFlight
    }
}

type MapReceiver = mpsc::Receiver<std::result::Result<(), wgpu::BufferAsyncError>>;

struct Slot {
    keypoints: wgpu::Buffer,
    descriptors: wgpu::Buffer,
    pending: Option<(MapReceiver, MapReceiver)>,
}

/// Ring of `depth >= 3` host-visible staging buffer pairs.
pub struct StagingRing {
    slots: Vec<Slot>,
    state: RingState,
}

impl StagingRing {
    /// Allocates `depth` pairs of MAP_READ staging buffers.
    pub fn new(
        device: &wgpu::Device,
        depth: usize,
        keypoint_bytes: u64,
        descriptor_bytes: u64,
    ) -> Result<Self> {
        let state = RingState::new(depth)?;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let slots = (0..depth)
            .map(|i| Slot {
                keypoints: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("staging keypoints {i}")),
                    size: keypoint_bytes,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                descriptors: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&format!("staging descriptors {i}")),
                    size: descriptor_bytes,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                pending: None,
            })
            .collect();
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(SiftError::Capacity {
                stage: "staging ring allocation",
                message: err.to_string(),
            });
        }
        Ok(StagingRing { slots, state })
    }

    /// Claims the current frame's slot and returns its buffers as copy
    /// destinations. Fails if the slot is still in flight.
    pub fn acquire(&mut self) -> Result<(usize, &wgpu::Buffer, &wgpu::Buffer)> {
        let slot = self.state.acquire()?;
        let s = &self.slots[slot];
        Ok((slot, &s.keypoints, &s.descriptors))
    }

    /// Requests the async maps for a slot the queue has just copied into.
    /// Must be called after the copy submission; does not block.
    pub fn submit(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        let (tx_k, rx_k) = mpsc::channel();
        s.keypoints
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |r| {
                let _ = tx_k.send(r);
            });
        let (tx_d, rx_d) = mpsc::channel();
        s.descriptors
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |r| {
                let _ = tx_d.send(r);
            });
        s.pending = Some((rx_k, rx_d));
        self.state.mark_in_flight(slot);
    }

    /// Awaits a previously submitted slot and returns copies of its
    /// keypoint and descriptor bytes, freeing the slot for re-use.
    pub fn wait(&mut self, slot: usize, device: &wgpu::Device) -> Result<(Vec<u8>, Vec<u8>)> {
        if !self.state.is_in_flight(slot) {
            return Err(SiftError::BadConfig(format!(
                "staging slot {slot} awaited without a submitted frame"
            )));
        }
        let s = &mut self.slots[slot];
        let (rx_k, rx_d) = s.pending.take().expect("in-flight slot has receivers");

        let mut recv = |rx: MapReceiver| -> Result<()> {
            loop {
                match rx.try_recv() {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(_)) => return Err(SiftError::DeviceLost("staging readback")),
                    Err(mpsc::TryRecvError::Empty) => {
                        device.poll(wgpu::Maintain::Wait);
                    }
                    Err(mpsc::TryRecvError::Disconnected) => {
                        return Err(SiftError::DeviceLost("staging readback"))
                    }
                }
            }
        };
        recv(rx_k)?;
        recv(rx_d)?;

        let kp_bytes = s.keypoints.slice(..).get_mapped_range().to_vec();
        s.keypoints.unmap();
        let desc_bytes = s.descriptors.slice(..).get_mapped_range().to_vec();
        s.descriptors.unmap();
        self.state.mark_consumed(slot);
        Ok((kp_bytes, desc_bytes))
    }

    /// Slot index the next acquired frame will use.
    pub fn current_slot(&self) -> usize {
        self.state.current()
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TextureKey {
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
}

/// Recycles input textures across frames of identical dimensions.
///
/// `release` must precede the next `acquire` with an identical descriptor
/// for the texture to be re-used; otherwise a fresh texture is created.
#[derive(Default)]
pub struct TexturePool {
    free: Vec<(TextureKey, wgpu::Texture)>,
}

impl TexturePool {
    pub fn new() -> Self {
        TexturePool::default()
    }

    pub fn acquire(
        &mut self,
        device: &wgpu::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> wgpu::Texture {
        let key = TextureKey {
            width,
            height,
            format,
        };
        if let Some(pos) = self.free.iter().position(|(k, _)| *k == key) {
            return self.free.swap_remove(pos).1;
        }
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pooled input texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        })
    }

    pub fn release(&mut self, texture: wgpu::Texture) {
        let key = TextureKey {
            width: texture.width(),
            height: texture.height(),
            format: texture.format(),
        };
        self.free.push((key, texture));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_depth_must_be_at_least_three() {
        assert!(RingState::new(2).is_err());
        assert!(RingState::new(3).is_ok());
    }

    #[test]
    fn ring_cycles_through_slots() {
        let mut ring = RingState::new(3).unwrap();
        for expected in [0usize, 1, 2, 0, 1] {
            let slot = ring.acquire().unwrap();
            assert_eq!(slot, expected);
            ring.mark_in_flight(slot);
            ring.mark_consumed(slot);
        }
    }

    #[test]
    fn reuse_before_await_is_rejected() {
        let mut ring = RingState::new(3).unwrap();
        for _ in 0..3 {
            let slot = ring.acquire().unwrap();
            ring.mark_in_flight(slot);
        }
        // Slot 0 comes around again but frame 0 was never consumed.
        let err = ring.acquire().unwrap_err();
        assert!(matches!(err, SiftError::BadConfig(_)));
    }
}
