use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi};

use super::{accounts, usage_types, usages, ApiRoot};
use crate::models::{Usage, UsageType};
use crate::query::{UsagePage, UsageTypePage};

/// OpenAPI document served at `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Carbon usage API",
        description = "Track carbon-relevant activity per user against a shared catalog of usage types."
    ),
    paths(
        accounts::signup,
        accounts::obtain_token,
        usage_types::list,
        usage_types::create,
        usage_types::retrieve,
        usage_types::replace,
        usage_types::partial_update,
        usage_types::destroy,
        usages::list,
        usages::create,
        usages::retrieve,
        usages::replace,
        usages::partial_update,
        usages::destroy,
    ),
    components(schemas(
        UsageType,
        Usage,
        UsageTypePage,
        UsagePage,
        ApiRoot,
        accounts::SignupResponse,
        accounts::TokenResponse,
    )),
    modifiers(&TokenAuth),
    tags(
        (name = "accounts", description = "Sign-up and API key exchange"),
        (name = "usage_type", description = "Shared usage type catalog"),
        (name = "usage", description = "Per-user usage records"),
    )
)]
pub struct ApiDoc;

/// `Authorization: Token <key>` header scheme.
struct TokenAuth;

impl Modify for TokenAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "token",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    "Authorization",
                    "`Token <key>` as returned by /signup/ or /api-token-auth/",
                ))),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_collections_and_auth_scheme() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/carbon_usage/usage/"));
        assert!(doc.paths.paths.contains_key("/carbon_usage/usage_type/{id}/"));
        assert!(doc.paths.paths.contains_key("/signup/"));
        let components = doc.components.expect("components");
        assert!(components.security_schemes.contains_key("token"));
        assert!(components.schemas.contains_key("UsagePage"));
        assert!(components.schemas.contains_key("UsageTypePage"));
    }
}
