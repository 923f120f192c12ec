use std::future::Future;
use std::sync::Arc;

use crate::accountant::process::{accountant_process, AccountantMessage, CycleSummary};
use crate::accountant::worker::JobAccountant;
use crate::accountant::AccountantConfig;
use crate::common::rpc::{initiate_request, make_rpc_queue, RpcSender};
use crate::store::StoreRef;

/// Handle for driving the accountant process from outside.
pub struct AccountantService {
    sender: RpcSender<AccountantMessage>,
}

impl AccountantService {
    /// Run an accounting cycle outside the regular schedule and return its
    /// summary.
    pub fn poll_now(&self) -> impl Future<Output = crate::Result<CycleSummary>> {
        let fut = initiate_request(|token| self.sender.send(AccountantMessage::PollNow(token)));
        async move { fut.await.unwrap() }
    }

    /// Cooperative shutdown: the current batch drains, then the process
    /// future resolves. No new poll cycles are started.
    pub fn quit(&self) {
        let _ = self.sender.send(AccountantMessage::Quit);
    }
}

pub fn create_accountant_service(
    store: StoreRef,
    accountant: Arc<dyn JobAccountant>,
    config: AccountantConfig,
) -> (AccountantService, impl Future<Output = ()>) {
    let (tx, rx) = make_rpc_queue();
    let process = accountant_process(store, accountant, config, rx);
    (AccountantService { sender: tx }, process)
}
