pub mod bundle;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod object;
pub mod reader;
pub mod serialized;
pub mod typetree;
pub mod version;
pub mod workset;

pub use bundle::{sniff_signature, BundleFile, ByteSource};
pub use cipher::{TitleConfig, TitleVariant};
pub use error::{Error, Result};
pub use object::{decode_object, dump_object, Value};
pub use serialized::{is_serialized_file, SerializedFile};
pub use typetree::{TypeTree, TypeTreeNode};
pub use workset::{CancelToken, PPtr, PtrState, WorkingSet};
