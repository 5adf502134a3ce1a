//! DMX datamodels: a GUID-identified element graph with typed attributes,
//! loaded from and saved to the Source engine's binary and keyvalues2
//! wire forms.
//!
//! # Example
//! ```no_run
//! use dmxmodel::{Datamodel, DeferredMode, Vector3};
//!
//! let mut dm = Datamodel::new("model", 1);
//! let root = dm.create_element("DmeModel", "root");
//! dm.set_root(root).unwrap();
//! dm.set(root, "scale", 0.5f32).unwrap();
//! dm.set(root, "origin", Vector3::new(0.0, 0.0, 64.0)).unwrap();
//!
//! dm.save_path("example.dmx", "binary", 5).unwrap();
//! let reloaded = Datamodel::load_path("example.dmx", DeferredMode::Automatic).unwrap();
//! assert_eq!(reloaded.root(), Some(root));
//! ```

pub mod attribute;
pub use attribute::{Attribute, AttributeValue, ElementRef, Value, ValueKind};

pub mod values;
pub use values::{Angle, Binary, Color, Matrix4, Quaternion, Vector2, Vector3, Vector4};

mod element;
pub use element::{Element, ElementArray};

mod datamodel;
pub use datamodel::{Datamodel, ImportMode, StubResolver};

pub mod codec;
pub use codec::{register_codec, Codec, CodecBinding, DeferredDecoder, DeferredMode, Header};

pub mod codecs;

mod error;
pub use error::{CodecSourceError, DmError, Result};
