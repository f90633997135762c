/// The trust domain used when a policy does not name one.
pub const DEFAULT_TRUST_DOMAIN: &str = "cluster.local";

/// Formats the mesh principal of a service account.
///
/// Inputs are not validated: empty names still produce a well-formed (if meaningless) principal.
pub fn service_account_principal(
    trust_domain: &str,
    namespace: &str,
    service_account: &str,
) -> String {
    format!("{trust_domain}/ns/{namespace}/sa/{service_account}")
}
