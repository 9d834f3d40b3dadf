//! Print wire test vectors for interop testing in other languages.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::codec::{Codec, JsonRpcCodec, MsgpackCodec};
use protocol::messages::*;
use serde_json::json;

fn main() {
    let mut kwargs = Kwargs::new();
    kwargs.insert("text".to_string(), json!("hello"));

    let vectors: Vec<(&str, Message)> = vec![
        (
            "call_positional",
            Request::call(RequestId::Number(1), "add", vec![json!(2), json!(3)], Kwargs::new()).into(),
        ),
        (
            "call_named",
            Request::call(RequestId::Number(2), "reverse_string", vec![], kwargs).into(),
        ),
        (
            "notification",
            Request::notification("log", vec![json!("started")], Kwargs::new()).into(),
        ),
        (
            "response",
            Response {
                id: RequestId::Number(1),
                result: json!(5),
            }
            .into(),
        ),
        (
            "method_not_found",
            ErrorResponse::new(
                Some(RequestId::Number(3)),
                ErrorCode::MethodNotFound,
                "Method not found: missing",
                None,
            )
            .into(),
        ),
    ];

    let json_codec = JsonRpcCodec;
    let msgpack_codec = MsgpackCodec;
    for (name, message) in &vectors {
        let text = json_codec.encode(message).expect("json encoding failed");
        println!("// {}", name);
        println!(
            "export const {}_json = {};",
            name,
            String::from_utf8_lossy(&text)
        );
        let bytes = msgpack_codec.encode(message).expect("msgpack encoding failed");
        print_bytes(&format!("{}_msgpack", name), &bytes);
    }
}

fn print_bytes(name: &str, bytes: &[u8]) {
    print!("export const {} = new Uint8Array([", name);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            print!(", ");
        }
        print!("{}", b);
    }
    println!("]);");
}
