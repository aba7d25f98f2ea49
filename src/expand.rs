use crate::types::{ProxyTarget, RequestSpec, WorkItem};

/// Build the worklist as the cartesian product of proxies and requests.
///
/// Ordering is proxy-major: every request for the first proxy, then every
/// request for the second, and so on. Either input being empty yields an
/// empty worklist.
pub fn expand_work_items(proxies: &[ProxyTarget], requests: &[RequestSpec]) -> Vec<WorkItem> {
    let mut items = Vec::with_capacity(proxies.len() * requests.len());
    for proxy in proxies {
        for request in requests {
            items.push(WorkItem::new(request.clone(), proxy.clone()));
        }
    }
    items
}
