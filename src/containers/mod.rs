//! Hash containers and the byte-buffer primitive shared by the object model
//! and the compiler/lexer.
//!
//! All three hash containers (byte-keyed interning set, byte-keyed table,
//! value-keyed table) share the same chained-bucket, split-rehash discipline
//! described in §4.3; [`hashtable::HashTable`] implements it once, generically
//! over the key type, and [`byteset::InternTable`] and the `Dict`/`Object`
//! payloads in `entity.rs` are thin instantiations over it.

pub mod byteset;
pub mod hashtable;
pub mod strbuf;

pub use byteset::InternTable;
pub use hashtable::HashTable;
pub use strbuf::ByteBuf;
