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

//! A macro to define bitflags in a structured way.

/// Declares a transparent flag set over an unsigned integer type, with set
/// operations, bitwise operators, and a human-readable `Debug` impl that
/// prints flag names instead of raw bits.
#[macro_export]
#[doc(hidden)]
macro_rules! rheo_bitflags {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$flag_attr:meta])*
                const $flag_name:ident = $flag_value:expr;
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis struct $name {
            pub(crate) bits: $ty,
        }

        impl $name {
            /// An empty set of flags.
            pub const EMPTY: Self = Self { bits: 0 };

            $(
                $(#[$flag_attr])*
                pub const $flag_name: Self = Self { bits: $flag_value };
            )*

            /// Creates a flag set from raw bits. Bits that do not correspond
            /// to a defined flag are kept.
            pub const fn from_bits_truncate(bits: $ty) -> Self {
                Self { bits }
            }

            /// Returns the raw value of the flag set.
            pub const fn bits(&self) -> $ty {
                self.bits
            }

            /// Returns `true` if all flags in `other` are present in `self`.
            pub const fn contains(&self, other: Self) -> bool {
                (self.bits & other.bits) == other.bits
            }

            /// Returns `true` if any flag in `other` is present in `self`.
            pub const fn intersects(&self, other: Self) -> bool {
                (self.bits & other.bits) != 0
            }

            /// Returns `true` if no flags are set.
            pub const fn is_empty(&self) -> bool {
                self.bits == 0
            }

            /// Inserts the flags in `other` into `self`.
            pub fn insert(&mut self, other: Self) {
                self.bits |= other.bits;
            }

            /// Removes the flags in `other` from `self`.
            pub fn remove(&mut self, other: Self) {
                self.bits &= !other.bits;
            }

            /// Returns a new set with `other` flags inserted.
            #[must_use]
            pub const fn with(mut self, other: Self) -> Self {
                self.bits |= other.bits;
                self
            }

            /// Returns a new set with `other` flags removed.
            #[must_use]
            pub const fn without(mut self, other: Self) -> Self {
                self.bits &= !other.bits;
                self
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, other: Self) -> Self {
                Self { bits: self.bits | other.bits }
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, other: Self) -> Self {
                Self { bits: self.bits & other.bits }
            }
        }

        impl core::ops::Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self { bits: !self.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, other: Self) {
                self.bits |= other.bits;
            }
        }

        impl core::ops::BitAndAssign for $name {
            fn bitand_assign(&mut self, other: Self) {
                self.bits &= other.bits;
            }
        }

        // Prints flag names rather than raw bits, with no allocations.
        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                let mut remaining = self.bits;
                let mut first = true;

                write!(f, "{}(", stringify!($name))?;

                $(
                    if ($flag_value != 0) && (remaining & $flag_value) == $flag_value {
                        if !first {
                            write!(f, " | ")?;
                        }
                        write!(f, "{}", stringify!($flag_name))?;
                        remaining &= !$flag_value;
                        first = false;
                    }
                )*

                if remaining != 0 {
                    if !first {
                        write!(f, " | ")?;
                    }
                    write!(f, "UNKNOWN({remaining:#x})")?;
                    first = false;
                }

                if self.bits == 0 && first {
                    write!(f, "EMPTY")?;
                }

                write!(f, ")")
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::rheo_bitflags;

    rheo_bitflags! {
        /// Flags used to exercise the macro.
        pub struct ProbeFlags: u32 {
            const READ = 1 << 0;
            const WRITE = 1 << 1;
            const COPY = 1 << 2;
        }
    }

    #[test]
    fn contains_and_intersects() {
        let set = ProbeFlags::READ | ProbeFlags::COPY;
        assert!(set.contains(ProbeFlags::READ));
        assert!(!set.contains(ProbeFlags::WRITE));
        assert!(set.contains(ProbeFlags::READ | ProbeFlags::COPY));
        assert!(set.intersects(ProbeFlags::WRITE | ProbeFlags::COPY));
        assert!(!set.intersects(ProbeFlags::WRITE));
    }

    #[test]
    fn insert_and_remove() {
        let mut set = ProbeFlags::EMPTY;
        assert!(set.is_empty());
        set.insert(ProbeFlags::WRITE);
        assert!(set.contains(ProbeFlags::WRITE));
        set.remove(ProbeFlags::WRITE);
        assert!(set.is_empty());
    }

    #[test]
    fn debug_prints_flag_names() {
        let set = ProbeFlags::READ | ProbeFlags::WRITE;
        assert_eq!(format!("{set:?}"), "ProbeFlags(READ | WRITE)");
        assert_eq!(format!("{:?}", ProbeFlags::EMPTY), "ProbeFlags(EMPTY)");
        let unknown = ProbeFlags::from_bits_truncate(1 << 9);
        assert_eq!(format!("{unknown:?}"), "ProbeFlags(UNKNOWN(0x200))");
    }
}
