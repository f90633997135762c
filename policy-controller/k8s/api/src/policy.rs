pub mod dynamic_authorization_policy;

pub use self::dynamic_authorization_policy::{
    DynamicAuthorizationPolicy, DynamicAuthorizationPolicySpec, DynamicAuthorizationPolicyStatus,
    DynamicPolicy,
};
