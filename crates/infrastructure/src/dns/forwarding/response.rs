use hickory_proto::op::{Message, MessageType, ResponseCode};

/// Empty reply to `request` carrying `rcode`. Synthesized locally, so RA
/// stays clear.
pub fn error_reply(request: &Message, rcode: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_response_code(rcode);
    reply.add_queries(request.queries().to_vec());
    reply
}

/// Checks that `reply` answers `request`: same id, response flag set and
/// the same single question.
pub fn validate_reply(request: &Message, reply: &Message) -> Result<(), String> {
    if reply.id() != request.id() {
        return Err(format!("id mismatch: sent {}, got {}", request.id(), reply.id()));
    }
    if reply.message_type() != MessageType::Response {
        return Err("reply is not a response".to_string());
    }

    let [asked] = request.queries() else {
        return Err(format!("request has {} questions", request.queries().len()));
    };
    let [answered] = reply.queries() else {
        return Err(format!("reply has {} questions", reply.queries().len()));
    };

    if answered.name() != asked.name() {
        return Err(format!("question mismatch: asked {}, got {}", asked.name(), answered.name()));
    }
    if answered.query_type() != asked.query_type() || answered.query_class() != asked.query_class() {
        return Err(format!(
            "question mismatch: asked {} {}, got {} {}",
            asked.query_class(),
            asked.query_type(),
            answered.query_class(),
            answered.query_type()
        ));
    }
    Ok(())
}
