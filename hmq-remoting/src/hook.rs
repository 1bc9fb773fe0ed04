//! Interceptors run around every remote call.

use hmq_protocol::Command;

/// Hook invoked before a request is handled or sent and after its response.
///
/// On the client side `do_before_request` may decorate the outgoing request
/// (for example with extra extension fields).
pub trait RpcHook: Send + Sync + 'static {
    fn do_before_request(&self, remote_addr: &str, request: &mut Command);

    fn do_after_response(&self, remote_addr: &str, request: &Command, response: Option<&Command>);
}
