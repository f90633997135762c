#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod mapping;
pub mod principal;
mod principal_set;
mod resource_id;
mod subject;


pub use self::{
    mapping::{ListSubjects, PolicyRule, PrincipalMapping},
    principal::{service_account_principal, DEFAULT_TRUST_DOMAIN},
    principal_set::PrincipalSet,
    resource_id::ResourceId,
    subject::Subject,
};
