//! Messages and client stub of the relay's `ephemeralpeer` service.
//!
//! ```proto
//! service EphemeralPeer {
//!   rpc RegisterPeerV1(EphemeralPeerRequestV1) returns (EphemeralPeerResponseV1) {}
//! }
//! ```

use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

const REGISTER_PEER_V1: &str = "/ephemeralpeer.EphemeralPeer/RegisterPeerV1";

#[derive(Clone, PartialEq, prost::Message)]
pub struct EphemeralPeerRequestV1 {
    #[prost(bytes = "vec", tag = "1")]
    pub wg_parent_pubkey: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub wg_ephemeral_peer_pubkey: Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub post_quantum: Option<PostQuantumRequestV1>,
    #[prost(message, optional, tag = "4")]
    pub daita: Option<DaitaRequestV1>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostQuantumRequestV1 {
    #[prost(message, repeated, tag = "1")]
    pub kem_pubkeys: Vec<KemPubkeyV1>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct KemPubkeyV1 {
    #[prost(string, tag = "1")]
    pub algorithm_name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub key_data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DaitaRequestV1 {
    #[prost(bool, tag = "1")]
    pub activate_daita: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EphemeralPeerResponseV1 {
    #[prost(message, optional, tag = "1")]
    pub post_quantum: Option<PostQuantumResponseV1>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PostQuantumResponseV1 {
    /// One per requested KEM, in request order
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub ciphertexts: Vec<Vec<u8>>,
}

pub struct EphemeralPeerClient {
    inner: tonic::client::Grpc<Channel>,
}

impl EphemeralPeerClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn register_peer_v1(
        &mut self,
        request: EphemeralPeerRequestV1,
    ) -> Result<EphemeralPeerResponseV1, tonic::Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = ProstCodec::<EphemeralPeerRequestV1, EphemeralPeerResponseV1>::default();
        let path = PathAndQuery::from_static(REGISTER_PEER_V1);
        let response = self
            .inner
            .unary(tonic::Request::new(request), path, codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_request_wire_layout() {
        let request = EphemeralPeerRequestV1 {
            wg_parent_pubkey: vec![1; 32],
            wg_ephemeral_peer_pubkey: vec![2; 32],
            post_quantum: None,
            daita: Some(DaitaRequestV1 {
                activate_daita: true,
            }),
        };
        let encoded = request.encode_to_vec();

        // field 1, length delimited, 32 bytes
        assert_eq!(&encoded[..2], &[0x0a, 32]);
        assert_eq!(&encoded[34..36], &[0x12, 32]);
        // field 4 holding `activate_daita = true`
        assert_eq!(&encoded[68..], &[0x22, 2, 0x08, 1]);
    }

    #[test]
    fn test_response_decodes_ciphertexts_in_order() {
        let response = EphemeralPeerResponseV1 {
            post_quantum: Some(PostQuantumResponseV1 {
                ciphertexts: vec![vec![0xaa; 3], vec![0xbb; 5]],
            }),
        };
        let decoded =
            EphemeralPeerResponseV1::decode(response.encode_to_vec().as_slice()).unwrap();
        let ciphertexts = decoded.post_quantum.unwrap().ciphertexts;
        assert_eq!(ciphertexts, vec![vec![0xaa; 3], vec![0xbb; 5]]);
    }
}
