//! Tests for the wire vocabulary.

use crate::Body;
use crate::ClientId;
use crate::Codec;
use crate::CorrelationId;
use crate::Envelope;
use crate::Error;
use crate::Fault;
use crate::FaultKind;
use crate::HostId;
use crate::ObjectId;
use crate::Reference;
use crate::ReferenceId;
use crate::Request;
use crate::Response;

#[test]
fn test_ids_are_unique_and_prefixed() {
    let a = ObjectId::new();
    let b = ObjectId::new();
    assert_ne!(a, b);
    assert!(a.to_string().starts_with("obj-"));
    assert!(HostId::new().to_string().starts_with("host-"));
    assert!(ClientId::new().to_string().starts_with("client-"));
    assert!(CorrelationId::new().to_string().starts_with("corr-"));
    // simple uuid form: 32 hex digits after the prefix
    assert_eq!(a.to_string().len(), "obj-".len() + 32);
}

#[test]
fn test_envelope_survives_both_codecs() {
    let object_id = ObjectId::new();
    let envelope = Envelope::request(
        CorrelationId::new(),
        Some(ClientId::new()),
        Some("ns.client.reply".into()),
        Request::StartInvocation {
            object_id,
            method: "add".into(),
            param_types: vec!["i64".into(), "i64".into()],
            args: vec![1, 2, 3],
        },
    );

    for codec in [Codec::Bincode, Codec::Json] {
        let bytes = codec.encode(&envelope).unwrap();
        let decoded: Envelope = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, envelope, "codec {}", codec.name());
        assert_eq!(decoded.as_request().and_then(Request::object_id), Some(object_id));
    }
}

#[test]
fn test_failed_response_carries_fault() {
    let fault = Fault::new(FaultKind::NoSuchMethod, "no method `frob()`");
    let envelope = Envelope::response(CorrelationId::new(), Response::Failed(fault.clone()));

    let bytes = Codec::Bincode.encode(&envelope).unwrap();
    let decoded: Envelope = Codec::Bincode.decode(&bytes).unwrap();

    match decoded.body {
        Body::Response(Response::Failed(f)) => assert_eq!(f, fault),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(fault.to_string(), "NoSuchMethod: no method `frob()`");
}

#[test]
fn test_garbage_does_not_decode() {
    let garbage = [0xff_u8, 0x00, 0x13];
    assert!(matches!(Codec::Bincode.decode::<Envelope>(&garbage), Err(Error::Decode(_))));
    assert!(matches!(Codec::Json.decode::<Envelope>(&garbage), Err(Error::Decode(_))));
}

#[test]
fn test_one_way_requests() {
    assert!(Request::Shutdown.is_one_way());
    assert!(Request::KeepAlive { object_id: ObjectId::new() }.is_one_way());
    assert!(!Request::Probe.is_one_way());
    assert!(!Request::DeleteObject { object_id: ObjectId::new() }.is_one_way());
    assert_eq!(Request::Probe.kind(), "probe");
}

#[test]
fn test_codec_names_parse_from_config_strings() {
    #[derive(serde::Deserialize)]
    struct Holder {
        codec: Codec,
    }
    let holder: Holder = serde_json::from_str(r#"{"codec":"json"}"#).unwrap();
    assert_eq!(holder.codec, Codec::Json);
    assert_eq!(Codec::default(), Codec::Bincode);
}

#[test]
fn test_result_collapses_into_response() {
    let ok: Result<Response, Fault> = Ok(Response::Ack);
    let err: Result<Response, Fault> = Err(Fault::raised("boom"));
    assert_eq!(Response::from(ok), Response::Ack);
    assert_eq!(Response::from(err).kind(), "failed");
}

#[test]
fn test_references_travel_inside_arguments() {
    let reference = Reference {
        id: ReferenceId::new(),
        owner: "cloudrun.client.callbacks".into(),
        class: "Listener".into(),
    };
    let args = Codec::Json.encode(&(reference.clone(), "hello")).unwrap();
    let request = Request::InvokeCallback {
        reference: reference.id,
        method: "notify".into(),
        param_types: vec!["&str".into()],
        args: args.clone(),
    };
    assert_eq!(request.kind(), "invoke_callback");
    assert_eq!(request.object_id(), None);
    assert!(!request.is_one_way());

    let (back, text): (Reference, String) = Codec::Json.decode(&args).unwrap();
    assert_eq!(back, reference);
    assert_eq!(text, "hello");
    assert!(reference.to_string().starts_with("Listener(ref-"));
}
