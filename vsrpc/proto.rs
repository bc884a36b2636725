//! Generated wire types for the frame protocol.
//!
//! These are produced by `prost-build` from `vsrpc.proto` at build time; see
//! `build.rs`. The module is re-exported at the crate root as [`crate::proto`].

include!(concat!(env!("OUT_DIR"), "/vsrpc.rs"));

impl Any {
    /// Wraps an encoded protobuf message under `type_url`.
    pub fn pack<M: prost::Message>(type_url: impl Into<String>, msg: &M) -> Self {
        Any {
            type_url: type_url.into(),
            value: msg.encode_to_vec(),
        }
    }

    /// Decodes the payload as `M`, regardless of `type_url`.
    pub fn unpack<M: prost::Message + Default>(&self) -> Result<M, prost::DecodeError> {
        M::decode(&self.value[..])
    }
}
