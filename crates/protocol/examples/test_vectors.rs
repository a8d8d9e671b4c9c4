//! Print encoded reference messages for backend interop testing.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::messages::{proto, props, typ, ErrorBody, ProtocolMessage, Status};
use protocol::MSG_BODY_SHELL_STARTED;

fn main() {
    let spawn = ProtocolMessage::new(proto::SHELL, typ::SPAWN)
        .with_property(props::USER_ID, "operator")
        .with_property(props::TERMINAL_WIDTH, 80u16)
        .with_property(props::TERMINAL_HEIGHT, 24u16);
    print_test_vector("spawn", &spawn);

    let started = ProtocolMessage::new(proto::SHELL, typ::SPAWN)
        .with_status(Status::Normal)
        .with_session_id("sess-1")
        .with_body(MSG_BODY_SHELL_STARTED);
    print_test_vector("spawn_ok", &started);

    let input = ProtocolMessage::new(proto::SHELL, typ::SHELL_COMMAND)
        .with_session_id("sess-1")
        .with_body(b"ls /\n".to_vec());
    print_test_vector("shell_input", &input);

    let busy = ProtocolMessage::new(proto::SHELL, typ::SPAWN)
        .with_status(Status::Error)
        .with_body(b"failed to start shell: shell is already running".to_vec());
    print_test_vector("spawn_busy", &busy);

    let unknown = ProtocolMessage::error_reply(12345, "bogus", "unknown protocol type 12345");
    print_test_vector("unknown_proto", &unknown);

    let body = ErrorBody {
        err: "session not found: sess-1".to_string(),
        msg_proto: Some(proto::SHELL),
        msg_type: Some(typ::STOP.to_string()),
    };
    println!(
        "// error body: {}",
        hex_line(&body.encode().expect("serialization failed"))
    );
}

fn print_test_vector(name: &str, message: &ProtocolMessage) {
    let bytes = message.encode().expect("serialization failed");
    println!("{name} = {}", hex_line(&bytes));
}

fn hex_line(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
