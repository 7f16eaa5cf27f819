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

//! Provides structs for representing extents (sizes) and origins (offsets).
//!
//! These types describe the dimensions of resources or regions within them.
//! They use integer (`u32`) components, making them suitable for representing
//! texel-based coordinates and sizes.

/// A three-dimensional extent, representing width, height, and depth.
///
/// This is used for texture dimensions, including 3D textures and
/// texture arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3D {
    /// The width component of the extent.
    pub width: u32,
    /// The height component of the extent.
    pub height: u32,
    /// The depth or number of array layers.
    pub depth_or_array_layers: u32,
}

impl Extent3D {
    /// Creates a new extent from its components.
    pub const fn new(width: u32, height: u32, depth_or_array_layers: u32) -> Self {
        Self {
            width,
            height,
            depth_or_array_layers,
        }
    }

    /// Returns the extent of the given mip level, halving each dimension per
    /// level and clamping to 1.
    pub const fn mip_level(&self, level: u32) -> Self {
        Self {
            width: max_u32(1, self.width >> level),
            height: max_u32(1, self.height >> level),
            depth_or_array_layers: self.depth_or_array_layers,
        }
    }

    /// Returns `true` if any component is zero.
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth_or_array_layers == 0
    }
}

/// A three-dimensional origin, representing an (x, y, z) offset.
///
/// This is often used to specify the corner of a region within a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Origin3D {
    /// The x-coordinate of the origin.
    pub x: u32,
    /// The y-coordinate of the origin.
    pub y: u32,
    /// The z-coordinate or array layer of the origin.
    pub z: u32,
}

impl Origin3D {
    /// The zero origin.
    pub const ZERO: Self = Self { x: 0, y: 0, z: 0 };

    /// Creates a new origin from its components.
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }
}

const fn max_u32(a: u32, b: u32) -> u32 {
    if a > b {
        a
    } else {
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_extent_clamps_to_one() {
        let extent = Extent3D::new(256, 64, 1);
        assert_eq!(extent.mip_level(0), Extent3D::new(256, 64, 1));
        assert_eq!(extent.mip_level(2), Extent3D::new(64, 16, 1));
        assert_eq!(extent.mip_level(8), Extent3D::new(1, 1, 1));
    }

    #[test]
    fn empty_extent() {
        assert!(Extent3D::new(0, 4, 1).is_empty());
        assert!(!Extent3D::new(4, 4, 1).is_empty());
    }
}
