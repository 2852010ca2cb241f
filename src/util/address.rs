use bytemuck::{NoUninit, Pod, Zeroable};

use std::fmt;
use std::ops::*;

/// size in bytes
pub type ByteSize = usize;

/// Address represents an arbitrary address in the managed heap, or the address of a
/// reference slot or a card table entry. It is a plain word with checked arithmetic
/// helpers; it is never dereferenced by this crate.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, Default, NoUninit)]
pub struct Address(usize);

/// Address + ByteSize (positive)
impl Add<ByteSize> for Address {
    type Output = Address;
    fn add(self, offset: ByteSize) -> Address {
        Address(self.0 + offset)
    }
}

/// Address += ByteSize (positive)
impl AddAssign<ByteSize> for Address {
    fn add_assign(&mut self, offset: ByteSize) {
        self.0 += offset;
    }
}

/// Address - ByteSize (positive)
impl Sub<ByteSize> for Address {
    type Output = Address;
    fn sub(self, offset: ByteSize) -> Address {
        Address(self.0 - offset)
    }
}

/// Address - Address (the first address must be higher)
impl Sub<Address> for Address {
    type Output = ByteSize;
    fn sub(self, other: Address) -> ByteSize {
        debug_assert!(
            self.0 >= other.0,
            "for (addr_a - addr_b), a({}) needs to be larger than b({})",
            self,
            other
        );
        self.0 - other.0
    }
}

/// Address ^ Address, used to test whether two addresses share a region.
impl BitXor<Address> for Address {
    type Output = usize;
    fn bitxor(self, other: Address) -> usize {
        self.0 ^ other.0
    }
}

/// Address >> shift (get an index)
impl Shr<usize> for Address {
    type Output = usize;
    fn shr(self, shift: usize) -> usize {
        self.0 >> shift
    }
}

impl Address {
    /// creates an arbitrary Address
    pub const fn from_usize(raw: usize) -> Address {
        Address(raw)
    }

    /// aligns down the address to the given alignment
    pub const fn align_down(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address(self.0 & !(align - 1))
    }

    /// aligns up the address to the given alignment
    pub const fn align_up(self, align: ByteSize) -> Address {
        debug_assert!(align.is_power_of_two());
        Address((self.0 + align - 1) & !(align - 1))
    }

    /// is this address aligned to the given alignment
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// converts the Address to a pointer-sized integer
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

/// allows Display format the Address (as hex value with 0x prefix)
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// allows Debug format the Address (as hex value with 0x prefix)
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// ObjectReference represents the address of a heap object as the barriers see it.
/// Compared with Address, operations allowed on ObjectReference are very limited:
/// no address arithmetic, only null tests and conversion to the raw address used
/// for region and mark-bitmap queries.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, Hash, PartialOrd, Ord, PartialEq, Default, Pod, Zeroable)]
pub struct ObjectReference(usize);

impl ObjectReference {
    /// The null object reference, represented as zero.
    pub const NULL: ObjectReference = ObjectReference(0);

    /// Cast the object reference to its raw address.
    pub const fn to_raw_address(self) -> Address {
        Address(self.0)
    }

    /// Cast a raw address to an object reference. This is how a binding creates `ObjectReference` instances.
    pub const fn from_raw_address(addr: Address) -> ObjectReference {
        ObjectReference(addr.0)
    }

    /// is this object reference null reference?
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// returns the ObjectReference as a word, the form stored in SATB buffers
    pub const fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down() {
        assert_eq!(
            Address::from_usize(0x10).align_down(0x10),
            Address::from_usize(0x10)
        );
        assert_eq!(
            Address::from_usize(0x11).align_down(0x10),
            Address::from_usize(0x10)
        );
        assert_eq!(
            Address::from_usize(0x2ff).align_down(0x100),
            Address::from_usize(0x200)
        );
    }

    #[test]
    fn align_up() {
        assert_eq!(
            Address::from_usize(0x11).align_up(0x10),
            Address::from_usize(0x20)
        );
        assert_eq!(
            Address::from_usize(0x20).align_up(0x10),
            Address::from_usize(0x20)
        );
    }

    #[test]
    fn same_region_by_xor() {
        let a = Address::from_usize(0x10_0008);
        let b = Address::from_usize(0x10_ff00);
        let c = Address::from_usize(0x20_0000);
        assert_eq!((a ^ b) >> 20, 0);
        assert_ne!((a ^ c) >> 20, 0);
    }

    #[test]
    fn null_reference() {
        assert!(ObjectReference::NULL.is_null());
        let o = ObjectReference::from_raw_address(Address::from_usize(0x1000));
        assert!(!o.is_null());
        assert_eq!(o.to_raw_address(), Address::from_usize(0x1000));
    }
}
