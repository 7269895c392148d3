use bytes::BytesMut;

use super::*;

const MAX: u32 = 4 * 1024 * 1024;

#[test]
fn frame_roundtrip() {
	for (data, compressed) in [
		(Bytes::from_static(b""), false),
		(Bytes::from_static(b"payload"), false),
		(Bytes::from_static(b"payload"), true),
		(Bytes::from(vec![0u8; 70_000]), false),
	] {
		let flags = if compressed { FLAG_COMPRESSED } else { 0 };
		let encoded = encode_frame(flags, &data);
		let mut buf = BytesMut::from(&encoded[..]);
		let frames = decode_frames(&mut buf, MAX).unwrap();
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].compressed, compressed);
		assert!(!frames[0].trailers);
		assert_eq!(frames[0].data, data);
		assert!(buf.is_empty());
	}
}

#[test]
fn partial_frames_left_in_buffer() {
	let encoded = encode_frame(0, b"hello world");
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&encoded[..7]);
	assert!(decode_frames(&mut buf, MAX).unwrap().is_empty());
	buf.extend_from_slice(&encoded[7..]);
	let frames = decode_frames(&mut buf, MAX).unwrap();
	assert_eq!(frames.len(), 1);
	assert_eq!(frames[0].data.as_ref(), b"hello world");
}

#[test]
fn multiple_frames_in_one_read() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&encode_frame(0, b"one"));
	buf.extend_from_slice(&encode_frame(FLAG_COMPRESSED, b"two"));
	buf.extend_from_slice(&encode_frame(FLAG_TRAILERS, b"grpc-status: 0\r\n"));
	let frames = decode_frames(&mut buf, MAX).unwrap();
	assert_eq!(frames.len(), 3);
	assert!(frames[1].compressed);
	assert!(frames[2].trailers);
}

#[test]
fn oversize_frame_rejected() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&[0, 0xff, 0xff, 0xff, 0xff]);
	assert!(matches!(
		decode_frames(&mut buf, MAX),
		Err(GrpcError::FrameTooLarge(_))
	));
}

#[test]
fn path_parsing() {
	let p = parse_path("/pkg.sub.Svc/Method").unwrap();
	assert_eq!(p.service.as_str(), "pkg.sub.Svc");
	assert_eq!(p.package.as_str(), "pkg.sub");
	assert_eq!(p.method.as_str(), "Method");

	// Empty package is permitted.
	let p = parse_path("/Svc/Method").unwrap();
	assert_eq!(p.service.as_str(), "Svc");
	assert_eq!(p.package.as_str(), "");

	assert!(parse_path("/onlyservice").is_err());
	assert!(parse_path("/a/b/c").is_err());
	assert!(parse_path("//Method").is_err());
}

#[test]
fn timeout_units() {
	assert_eq!(parse_timeout("1H").unwrap(), Duration::from_secs(3600));
	assert_eq!(parse_timeout("2M").unwrap(), Duration::from_secs(120));
	assert_eq!(parse_timeout("30S").unwrap(), Duration::from_secs(30));
	assert_eq!(parse_timeout("250m").unwrap(), Duration::from_millis(250));
	// Sub-millisecond units round up.
	assert_eq!(parse_timeout("1u").unwrap(), Duration::from_millis(1));
	assert_eq!(parse_timeout("1500u").unwrap(), Duration::from_millis(2));
	assert_eq!(parse_timeout("999999n").unwrap(), Duration::from_millis(1));
	assert!(parse_timeout("").is_err());
	assert!(parse_timeout("5").is_err());
	assert!(parse_timeout("x5S").is_err());
	assert!(parse_timeout("1234567890S").is_err());
}

#[test]
fn timeout_format_roundtrip() {
	let d = Duration::from_millis(1500);
	assert_eq!(parse_timeout(&format_timeout(d)).unwrap(), d);
}

#[test]
fn grpc_message_percent_coding() {
	let msg = "denied: path /admin% not allowed\n";
	let encoded = encode_grpc_message(msg);
	assert!(!encoded.contains('\n'));
	assert_eq!(decode_grpc_message(&encoded), msg);
}

#[test]
fn metadata_mapping() {
	use http::{HeaderName, HeaderValue};
	let mut headers = HeaderMap::new();
	headers.insert("content-type", HeaderValue::from_static("application/grpc"));
	headers.insert("grpc-timeout", HeaderValue::from_static("1S"));
	headers.insert("x-request-id", HeaderValue::from_static("abc"));
	{
		use base64::Engine;
		let bin = base64::engine::general_purpose::STANDARD_NO_PAD.encode(b"\x01\x02");
		headers.insert(
			HeaderName::from_static("x-trace-bin"),
			HeaderValue::try_from(bin).unwrap(),
		);
	}
	let md = metadata_from_headers(&headers);
	assert_eq!(md.len(), 2);
	assert!(
		md.iter()
			.any(|(k, v)| k.as_str() == "x-request-id" && *v == MetadataValue::Ascii("abc".into()))
	);
	assert!(
		md.iter()
			.any(|(k, v)| k.as_str() == "x-trace-bin" && *v == MetadataValue::Binary(vec![1, 2]))
	);

	let mut out = HeaderMap::new();
	metadata_into_headers(&md, &mut out);
	assert_eq!(out.get("x-request-id").unwrap(), "abc");
	assert!(out.contains_key("x-trace-bin"));
}

#[test]
fn content_type_classification() {
	assert_eq!(
		classify_content_type("application/grpc"),
		Some(GrpcContentType::Native)
	);
	assert_eq!(
		classify_content_type("application/grpc+proto"),
		Some(GrpcContentType::Native)
	);
	assert_eq!(
		classify_content_type("application/grpc-web+proto"),
		Some(GrpcContentType::Web)
	);
	assert_eq!(
		classify_content_type("application/grpc-web-text"),
		Some(GrpcContentType::WebText)
	);
	assert_eq!(classify_content_type("application/grpc-websocket"), None);
	assert_eq!(classify_content_type("text/plain"), None);
}

#[test]
fn service_patterns() {
	assert!(service_matches("**", "a.b.Svc"));
	assert!(service_matches("pkg.*", "pkg.Svc"));
	assert!(!service_matches("pkg.*", "pkg.sub.Svc"));
	assert!(!service_matches("pkg.*", "other.Svc"));
	assert!(service_matches("pkg.Svc", "pkg.Svc"));
	assert!(!service_matches("pkg.Svc", "pkg.Other"));
}

#[test]
fn method_patterns() {
	assert!(method_matches("pkg.Svc/*", "pkg.Svc", "Do"));
	assert!(method_matches("pkg.Svc/Do", "pkg.Svc", "Do"));
	assert!(!method_matches("pkg.Svc/Do", "pkg.Svc", "Other"));
	assert!(!method_matches("pkg.Svc", "pkg.Svc", "Do"));
}

#[test]
fn web_trailer_frame() {
	let trailers = status_trailers(status::PERMISSION_DENIED, "denied");
	let frame = encode_web_trailers(&trailers);
	assert_eq!(frame[0], FLAG_TRAILERS);
	let mut buf = BytesMut::from(&frame[..]);
	let frames = decode_frames(&mut buf, MAX).unwrap();
	assert!(frames[0].trailers);
	let text = String::from_utf8(frames[0].data.to_vec()).unwrap();
	assert!(text.contains("grpc-status: 7"));
	assert!(text.contains("grpc-message: denied"));
}
