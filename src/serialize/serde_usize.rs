//! Serialize raw addresses as plain integers, for use with
//! `#[serde(with = "serde_usize")]`.
//!
//! Raw pointers have no serde impls, and the JSON dump of live blocks
//! (`BlockInfo::address`) should show addresses that can be compared with
//! `Handle::addr()`.

use std::marker::PhantomData;

use serde::{de::Visitor, Deserializer, Serializer};

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl<T> AsUsize for *const T {
    fn as_usize(self) -> usize {
        self as usize
    }
}

impl<T> FromUsize for *const T {
    fn from_usize(value: usize) -> Self {
        value as Self
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: AsUsize,
{
    serializer.serialize_u64((*value).as_usize() as u64)
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct AddressVisitor<Ptr>(PhantomData<Ptr>);

    impl<'de, Ptr> Visitor<'de> for AddressVisitor<Ptr>
    where
        Ptr: FromUsize,
    {
        type Value = Ptr;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an address")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v)
                .map(Ptr::from_usize)
                .map_err(|_| E::custom("address does not fit in usize"))
        }
    }

    deserializer.deserialize_u64(AddressVisitor::<T>(PhantomData))
}
