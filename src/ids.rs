//! Stable integer identifiers for applications, contexts, and cores.
//!
//! These are thin newtypes over `u32` rather than bare integers so that the
//! three id spaces can't be silently confused at a call site (a mistake the
//! original C++ implementation's bare `int app_id`/`int ctx_id`/`int core_id`
//! parameters made easy to commit).

use std::fmt;

macro_rules! def_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                Self(raw)
            }
        }
    };
}

def_id!(AppId, "A");
def_id!(CtxId, "T");
def_id!(CoreId, "C");
