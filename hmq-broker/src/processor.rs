//! Send-message request processing.

use crate::header::{SendMessageRequestHeader, SendMessageResponseHeader};
use crate::request_code::SEND_MESSAGE;
use hmq_protocol::{Command, ResponseCode};
use hmq_remoting::{ProcessorError, RequestContext, RequestProcessor};
use hmq_store::{AppendStatus, MessageStore, StoredMessage};
use std::sync::Arc;

/// Appends incoming messages to the store and answers with their ids.
pub struct SendMessageProcessor {
    store: Arc<dyn MessageStore>,
}

impl SendMessageProcessor {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    fn send_message(&self, ctx: &RequestContext, request: &Command) -> Command {
        let header: SendMessageRequestHeader = match request.decode_header() {
            Ok(header) => header,
            Err(e) => return Command::response(ResponseCode::SystemError, e.to_string()),
        };
        tracing::debug!(
            "Message from {} for topic '{}', {} bytes",
            ctx.remote_addr(),
            header.topic,
            request.body.len()
        );

        let message = StoredMessage::new(header.topic, request.body.clone())
            .with_properties(header.properties.unwrap_or_default())
            .with_born_timestamp(header.born_timestamp)
            .with_born_host(ctx.remote_addr().to_string());

        let result = match self.store.append(&message) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Append to store failed for topic '{}': {}", message.topic, e);
                return Command::response(ResponseCode::SystemError, e.to_string());
            }
        };
        match result.status {
            AppendStatus::PutOk => Command::success_with_header(&SendMessageResponseHeader {
                msg_id: result.msg_id,
                queue_offset: Some(result.queue_offset as i64),
            }),
            AppendStatus::MessageIllegal => Command::response(
                ResponseCode::SystemError,
                format!("the message is illegal, topic '{}'", message.topic),
            ),
            AppendStatus::PropertiesSizeExceeded => Command::response(
                ResponseCode::SystemError,
                format!("message properties too long: {} bytes", message.properties.len()),
            ),
        }
    }
}

impl RequestProcessor for SendMessageProcessor {
    fn process_request(
        &self,
        ctx: &RequestContext,
        request: &Command,
    ) -> Result<Option<Command>, ProcessorError> {
        match request.code {
            SEND_MESSAGE => Ok(Some(self.send_message(ctx, request))),
            code => Ok(Some(Command::response(
                ResponseCode::RequestCodeNotSupported,
                format!(" request type {} not supported", code),
            ))),
        }
    }
}
