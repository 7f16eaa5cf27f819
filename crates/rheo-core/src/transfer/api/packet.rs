// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Defines the data packets handed to the pipeline by content producers.

use std::collections::HashMap;
use std::ops::Range;

/// Identifies one (mip level, array layer) slice of a texture resource.
///
/// Linear buffers have exactly one subresource, `SubresourceIndex::WHOLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SubresourceIndex {
    /// The mip level of the slice.
    pub mip: u32,
    /// The array layer of the slice.
    pub layer: u32,
}

impl SubresourceIndex {
    /// The single subresource of a linear buffer, or the base slice of a
    /// texture.
    pub const WHOLE: Self = Self { mip: 0, layer: 0 };

    /// Creates a subresource index from a mip level and array layer.
    pub const fn new(mip: u32, layer: u32) -> Self {
        Self { mip, layer }
    }
}

/// Row and slice strides of a block of pixel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Pitches {
    /// The distance in bytes between the starts of two consecutive rows.
    pub row_pitch: u32,
    /// The distance in bytes between the starts of two consecutive depth
    /// slices (or the size of one whole 2D slice).
    pub slice_pitch: u32,
}

/// An opaque, shareable block of source data for one or more subresources.
///
/// Packets are produced lazily by content loaders and consumed by transfer
/// operations. Several transfers may share one packet (via
/// `Arc<dyn DataPacket>`) when copying the same data to multiple
/// destinations. A subresource with no data is reported as `None` and is
/// treated by the pipeline as "no update for this slice", never as an error.
pub trait DataPacket: Send + Sync {
    /// Returns the bytes for the given subresource, if the packet carries
    /// any.
    fn data(&self, subresource: SubresourceIndex) -> Option<&[u8]>;

    /// Returns the pitches describing the layout of the subresource's bytes.
    ///
    /// The return value is meaningful only for subresources for which
    /// [`DataPacket::data`] returns `Some`.
    fn pitches(&self, subresource: SubresourceIndex) -> Pitches;
}

/// A [`DataPacket`] backed by a single contiguous byte buffer, with
/// per-subresource ranges into it.
#[derive(Debug, Default)]
pub struct BytesPacket {
    bytes: Vec<u8>,
    subresources: HashMap<SubresourceIndex, (Range<usize>, Pitches)>,
}

impl BytesPacket {
    /// Creates a packet whose whole buffer is the single subresource
    /// `(mip 0, layer 0)`, tightly packed.
    pub fn linear(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        let pitches = Pitches {
            row_pitch: len as u32,
            slice_pitch: len as u32,
        };
        let mut subresources = HashMap::new();
        subresources.insert(SubresourceIndex::WHOLE, (0..len, pitches));
        Self {
            bytes,
            subresources,
        }
    }

    /// Creates a packet from a slice of plain-old-data values, tightly
    /// packed as the single subresource `(mip 0, layer 0)`.
    pub fn from_pod<T: bytemuck::NoUninit>(values: &[T]) -> Self {
        Self::linear(bytemuck::cast_slice(values).to_vec())
    }

    /// Creates an empty packet to be populated with
    /// [`BytesPacket::with_subresource`].
    pub fn empty(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            subresources: HashMap::new(),
        }
    }

    /// Registers `range` of the backing buffer as the data for
    /// `subresource`, described by `pitches`.
    ///
    /// ## Panics
    /// Panics if `range` lies outside the backing buffer; packet assembly
    /// is producer-side setup code, not a runtime fallible path.
    pub fn with_subresource(
        mut self,
        subresource: SubresourceIndex,
        range: Range<usize>,
        pitches: Pitches,
    ) -> Self {
        assert!(
            range.end <= self.bytes.len(),
            "subresource range {range:?} outside packet of {} bytes",
            self.bytes.len()
        );
        self.subresources.insert(subresource, (range, pitches));
        self
    }
}

impl DataPacket for BytesPacket {
    fn data(&self, subresource: SubresourceIndex) -> Option<&[u8]> {
        self.subresources
            .get(&subresource)
            .map(|(range, _)| &self.bytes[range.clone()])
    }

    fn pitches(&self, subresource: SubresourceIndex) -> Pitches {
        self.subresources
            .get(&subresource)
            .map(|(_, pitches)| *pitches)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_packet_exposes_single_subresource() {
        let packet = BytesPacket::linear(vec![1, 2, 3, 4]);
        assert_eq!(packet.data(SubresourceIndex::WHOLE), Some(&[1, 2, 3, 4][..]));
        assert_eq!(packet.data(SubresourceIndex::new(1, 0)), None);
        assert_eq!(packet.pitches(SubresourceIndex::WHOLE).row_pitch, 4);
    }

    #[test]
    fn sparse_subresources() {
        let pitches = Pitches {
            row_pitch: 2,
            slice_pitch: 4,
        };
        let packet = BytesPacket::empty(vec![9, 8, 7, 6, 5, 4])
            .with_subresource(SubresourceIndex::new(1, 0), 2..6, pitches);

        assert_eq!(packet.data(SubresourceIndex::WHOLE), None);
        assert_eq!(
            packet.data(SubresourceIndex::new(1, 0)),
            Some(&[7, 6, 5, 4][..])
        );
        assert_eq!(packet.pitches(SubresourceIndex::new(1, 0)), pitches);
    }

    #[test]
    fn pod_packet_round_trips_bytes() {
        let values: [u32; 2] = [0x0403_0201, 0x0807_0605];
        let packet = BytesPacket::from_pod(&values);
        assert_eq!(
            packet.data(SubresourceIndex::WHOLE),
            Some(&[1u8, 2, 3, 4, 5, 6, 7, 8][..])
        );
    }
}
