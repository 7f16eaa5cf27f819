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

//! Defines data structures describing transferable GPU resources.

use crate::math::{Extent3D, Origin3D};
use crate::rheo_bitflags;
use crate::transfer::api::packet::Pitches;
use crate::transfer::error::TransferError;

/// The fundamental shape of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A flat, byte-addressed buffer (vertex, index, uniform data).
    LinearBuffer,
    /// A texture with mip levels and array layers.
    Texture,
}

/// The format of the texels in a texture resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexelFormat {
    /// Single 8-bit unsigned normalized channel.
    R8Unorm,
    /// Two 8-bit unsigned normalized channels.
    Rg8Unorm,
    /// Four 8-bit unsigned normalized channels.
    Rgba8Unorm,
    /// Four 8-bit unsigned normalized channels, BGRA order.
    Bgra8Unorm,
    /// Single 16-bit float channel.
    R16Float,
    /// Four 16-bit float channels.
    Rgba16Float,
    /// Single 32-bit float channel.
    R32Float,
    /// Four 32-bit float channels.
    Rgba32Float,
}

impl TexelFormat {
    /// Returns the size of one texel in bytes.
    pub const fn bytes_per_texel(&self) -> u32 {
        match self {
            TexelFormat::R8Unorm => 1,
            TexelFormat::Rg8Unorm | TexelFormat::R16Float => 2,
            TexelFormat::Rgba8Unorm | TexelFormat::Bgra8Unorm | TexelFormat::R32Float => 4,
            TexelFormat::Rgba16Float => 8,
            TexelFormat::Rgba32Float => 16,
        }
    }
}

rheo_bitflags! {
    /// A set of flags describing the allowed usages of a resource.
    ///
    /// The backend uses them to place the resource in the most suitable
    /// memory type (e.g., GPU-only vs. CPU-visible) and the scheduler uses
    /// them to choose between the direct-map and staging upload paths.
    pub struct ResourceUsage: u32 {
        /// The resource can be mapped for reading on the CPU.
        const MAP_READ = 1 << 0;
        /// The resource can be mapped for writing on the CPU.
        const MAP_WRITE = 1 << 1;
        /// The resource can be the source of a copy operation.
        const COPY_SRC = 1 << 2;
        /// The resource can be the destination of a copy operation.
        const COPY_DST = 1 << 3;

        /// The resource can be bound as a vertex buffer.
        const VERTEX = 1 << 4;
        /// The resource can be bound as an index buffer.
        const INDEX = 1 << 5;
        /// The resource can be bound as a uniform buffer.
        const UNIFORM = 1 << 6;
        /// The resource can be bound in a shader for sampling.
        const TEXTURE_BINDING = 1 << 7;
    }
}

/// An opaque handle to a backend resource.
///
/// Returned by [`UploadContext::create_resource`] and used to reference the
/// resource in all subsequent operations.
///
/// [`UploadContext::create_resource`]: crate::transfer::traits::UploadContext::create_resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(pub usize);

/// A descriptor used to create a resource.
///
/// Immutable once the resource has been created from it: the pipeline never
/// resizes or re-formats a live resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// An optional debug label for the resource.
    pub label: Option<String>,
    /// The fundamental shape of the resource.
    pub kind: ResourceKind,
    /// Texture dimensions at mip level 0. Ignored for linear buffers.
    pub extent: Extent3D,
    /// The number of mip levels. Must be at least 1 for textures.
    pub mip_level_count: u32,
    /// The number of array layers. Must be at least 1 for textures.
    pub array_layer_count: u32,
    /// The texel format. Ignored for linear buffers.
    pub format: TexelFormat,
    /// A bitmask of [`ResourceUsage`] flags.
    pub usage: ResourceUsage,
    /// The total size in bytes. Authoritative for linear buffers; derived
    /// from the extent and format for textures.
    pub size: u64,
}

impl ResourceDescriptor {
    /// Creates a descriptor for a linear buffer of `size` bytes.
    pub fn buffer(label: Option<&str>, size: u64, usage: ResourceUsage) -> Self {
        Self {
            label: label.map(str::to_owned),
            kind: ResourceKind::LinearBuffer,
            extent: Extent3D::default(),
            mip_level_count: 1,
            array_layer_count: 1,
            format: TexelFormat::R8Unorm,
            usage,
            size,
        }
    }

    /// Creates a descriptor for a 2D texture (optionally an array).
    pub fn texture_2d(
        label: Option<&str>,
        extent: Extent3D,
        mip_level_count: u32,
        array_layer_count: u32,
        format: TexelFormat,
        usage: ResourceUsage,
    ) -> Self {
        let mut desc = Self {
            label: label.map(str::to_owned),
            kind: ResourceKind::Texture,
            extent,
            mip_level_count,
            array_layer_count,
            format,
            usage,
            size: 0,
        };
        desc.size = desc.total_size_bytes();
        desc
    }

    /// Returns `true` for texture resources.
    pub fn is_texture(&self) -> bool {
        self.kind == ResourceKind::Texture
    }

    /// Checks the descriptor for internal consistency.
    ///
    /// ## Errors
    /// * `TransferError::InvalidDescriptor` - If a buffer has zero size, a
    ///   texture has an empty extent, or mip/array counts are below 1.
    pub fn validate(&self) -> Result<(), TransferError> {
        match self.kind {
            ResourceKind::LinearBuffer => {
                if self.size == 0 {
                    return Err(TransferError::InvalidDescriptor(
                        "linear buffer must have a non-zero size".into(),
                    ));
                }
            }
            ResourceKind::Texture => {
                if self.extent.is_empty() {
                    return Err(TransferError::InvalidDescriptor(format!(
                        "texture extent {:?} has a zero component",
                        self.extent
                    )));
                }
                if self.mip_level_count < 1 || self.array_layer_count < 1 {
                    return Err(TransferError::InvalidDescriptor(format!(
                        "texture must have at least 1 mip and 1 layer (got {} mips, {} layers)",
                        self.mip_level_count, self.array_layer_count
                    )));
                }
                let max_dim = self.extent.width.max(self.extent.height);
                let max_mips = 32 - max_dim.leading_zeros();
                if self.mip_level_count > max_mips {
                    return Err(TransferError::InvalidDescriptor(format!(
                        "{} mip levels exceed the {} supported by a {}x{} texture",
                        self.mip_level_count, max_mips, self.extent.width, self.extent.height
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the extent of the given mip level.
    pub fn mip_extent(&self, mip: u32) -> Extent3D {
        self.extent.mip_level(mip)
    }

    /// Returns the size of one tightly packed row at the given mip level.
    pub fn row_size_bytes(&self, mip: u32) -> u64 {
        match self.kind {
            ResourceKind::LinearBuffer => self.size,
            ResourceKind::Texture => {
                self.mip_extent(mip).width as u64 * self.format.bytes_per_texel() as u64
            }
        }
    }

    /// Returns the size of one (mip, layer) subresource in bytes.
    pub fn subresource_size_bytes(&self, mip: u32) -> u64 {
        match self.kind {
            ResourceKind::LinearBuffer => self.size,
            ResourceKind::Texture => self.row_size_bytes(mip) * self.mip_extent(mip).height as u64,
        }
    }

    /// Returns the total size of the resource across all subresources.
    pub fn total_size_bytes(&self) -> u64 {
        match self.kind {
            ResourceKind::LinearBuffer => self.size,
            ResourceKind::Texture => {
                let per_layer: u64 = (0..self.mip_level_count)
                    .map(|mip| self.subresource_size_bytes(mip))
                    .sum();
                per_layer * self.array_layer_count as u64
            }
        }
    }

    /// Returns the number of (mip, layer) subresources.
    pub fn subresource_count(&self) -> u32 {
        match self.kind {
            ResourceKind::LinearBuffer => 1,
            ResourceKind::Texture => self.mip_level_count * self.array_layer_count,
        }
    }

    /// Returns the tightly packed pitches for the given mip level.
    pub fn tight_pitches(&self, mip: u32) -> Pitches {
        Pitches {
            row_pitch: self.row_size_bytes(mip) as u32,
            slice_pitch: self.subresource_size_bytes(mip) as u32,
        }
    }

    /// Derives the descriptor of a staging resource able to hold the data of
    /// `region` (or of the whole resource when `region` is `None`).
    ///
    /// Staging resources are CPU-writable copy sources. A boxed update gets
    /// a staging surface shaped like the box, carrying as much of the
    /// destination's mip chain as the box extent supports so every
    /// requested (mip, layer) pair has a home; a full update mirrors the
    /// destination's shape.
    pub fn staging_descriptor(&self, region: Option<&RegionBox>) -> ResourceDescriptor {
        let label = self
            .label
            .as_deref()
            .map(|l| format!("{l} [staging]"))
            .or_else(|| Some("[staging]".to_owned()));
        let usage = ResourceUsage::MAP_WRITE | ResourceUsage::COPY_SRC;
        let mut staging = match (self.kind, region) {
            (ResourceKind::LinearBuffer, _) => Self {
                kind: ResourceKind::LinearBuffer,
                ..self.clone()
            },
            (ResourceKind::Texture, Some(region)) => {
                let mut desc = self.clone();
                desc.extent = region.extent;
                let max_dim = region.extent.width.max(region.extent.height).max(1);
                desc.mip_level_count = self.mip_level_count.min(32 - max_dim.leading_zeros());
                desc.size = 0;
                desc.size = desc.total_size_bytes();
                desc
            }
            (ResourceKind::Texture, None) => self.clone(),
        };
        staging.label = label;
        staging.usage = usage;
        staging
    }
}

/// A rectangular region within a resource, used for partial updates.
///
/// The box is expressed at mip level 0 and applies to every updated
/// subresource, shifted down per mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionBox {
    /// The corner of the region closest to the origin.
    pub origin: Origin3D,
    /// The size of the region.
    pub extent: Extent3D,
}

impl RegionBox {
    /// Creates a new region from its origin and extent.
    pub const fn new(origin: Origin3D, extent: Extent3D) -> Self {
        Self { origin, extent }
    }

    /// Checks the region against the descriptor it targets.
    ///
    /// ## Errors
    /// * `TransferError::InvalidDescriptor` - If the region is empty, lies
    ///   outside the resource extents, or targets a linear buffer.
    pub fn validate_against(&self, descriptor: &ResourceDescriptor) -> Result<(), TransferError> {
        if descriptor.kind == ResourceKind::LinearBuffer {
            return Err(TransferError::InvalidDescriptor(
                "region boxes apply to textures, not linear buffers".into(),
            ));
        }
        if self.extent.is_empty() {
            return Err(TransferError::InvalidDescriptor(
                "region box has an empty extent".into(),
            ));
        }
        let bounds = descriptor.extent;
        let fits = self.origin.x.checked_add(self.extent.width).is_some_and(|x| x <= bounds.width)
            && self
                .origin
                .y
                .checked_add(self.extent.height)
                .is_some_and(|y| y <= bounds.height)
            && self
                .origin
                .z
                .checked_add(self.extent.depth_or_array_layers)
                .is_some_and(|z| z <= bounds.depth_or_array_layers);
        if !fits {
            return Err(TransferError::InvalidDescriptor(format!(
                "region {:?}+{:?} lies outside resource extent {:?}",
                self.origin, self.extent, bounds
            )));
        }
        Ok(())
    }

    /// Returns the region shifted down to the given mip level, clamping each
    /// dimension to at least one texel.
    pub fn mip_level(&self, mip: u32) -> RegionBox {
        RegionBox {
            origin: Origin3D::new(self.origin.x >> mip, self.origin.y >> mip, self.origin.z),
            extent: self.extent.mip_level(mip),
        }
    }

    /// Returns `true` if the region covers the whole of `extent`.
    pub fn is_full(&self, extent: &Extent3D) -> bool {
        self.origin == Origin3D::ZERO && self.extent == *extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_texture() -> ResourceDescriptor {
        ResourceDescriptor::texture_2d(
            Some("sample"),
            Extent3D::new(64, 32, 1),
            3,
            2,
            TexelFormat::Rgba8Unorm,
            ResourceUsage::COPY_DST | ResourceUsage::TEXTURE_BINDING,
        )
    }

    #[test]
    fn buffer_validation() {
        let good = ResourceDescriptor::buffer(None, 128, ResourceUsage::VERTEX);
        assert!(good.validate().is_ok());

        let empty = ResourceDescriptor::buffer(None, 0, ResourceUsage::VERTEX);
        assert!(matches!(
            empty.validate(),
            Err(TransferError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn texture_validation() {
        assert!(sample_texture().validate().is_ok());

        let mut no_mips = sample_texture();
        no_mips.mip_level_count = 0;
        assert!(no_mips.validate().is_err());

        let mut too_many_mips = sample_texture();
        too_many_mips.mip_level_count = 12;
        assert!(too_many_mips.validate().is_err());

        let mut flat = sample_texture();
        flat.extent.height = 0;
        assert!(flat.validate().is_err());
    }

    #[test]
    fn texture_sizes() {
        let desc = sample_texture();
        // 64x32 + 32x16 + 16x8 texels at 4 bytes each, for 2 layers.
        let per_layer = (64 * 32 + 32 * 16 + 16 * 8) * 4;
        assert_eq!(desc.subresource_size_bytes(0), 64 * 32 * 4);
        assert_eq!(desc.total_size_bytes(), per_layer * 2);
        assert_eq!(desc.subresource_count(), 6);
        assert_eq!(desc.row_size_bytes(1), 32 * 4);
    }

    #[test]
    fn region_bounds_check() {
        let desc = sample_texture();
        let inside = RegionBox::new(Origin3D::new(16, 8, 0), Extent3D::new(32, 16, 1));
        assert!(inside.validate_against(&desc).is_ok());

        let outside = RegionBox::new(Origin3D::new(48, 0, 0), Extent3D::new(32, 8, 1));
        assert!(outside.validate_against(&desc).is_err());

        let empty = RegionBox::new(Origin3D::ZERO, Extent3D::new(0, 4, 1));
        assert!(empty.validate_against(&desc).is_err());
    }

    #[test]
    fn staging_descriptor_for_boxed_update() {
        let desc = sample_texture();
        let region = RegionBox::new(Origin3D::new(4, 4, 0), Extent3D::new(8, 8, 1));
        let staging = desc.staging_descriptor(Some(&region));
        assert_eq!(staging.extent, Extent3D::new(8, 8, 1));
        // The destination's full mip chain fits within an 8x8 box.
        assert_eq!(staging.mip_level_count, 3);
        assert!(staging.usage.contains(ResourceUsage::MAP_WRITE));
        assert!(staging.usage.contains(ResourceUsage::COPY_SRC));
        assert_eq!(staging.size, (8 * 8 + 4 * 4 + 2 * 2) * 4 * 2);
        assert_eq!(staging.label.as_deref(), Some("sample [staging]"));
        assert!(staging.validate().is_ok());

        // A box too small for the whole chain clamps the staging mips.
        let tiny = RegionBox::new(Origin3D::ZERO, Extent3D::new(2, 2, 1));
        let staging = desc.staging_descriptor(Some(&tiny));
        assert_eq!(staging.mip_level_count, 2);
        assert!(staging.validate().is_ok());
    }
}
