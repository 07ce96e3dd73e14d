//! Dependent requests: follow-up endpoint calls derived from a response
//!
//! An endpoint's configuration maps other endpoints to addresses inside its
//! response. Resolving each address yields one parameter record per match,
//! and each record becomes one concrete request:
//!
//! ```rust
//! use indexmap::IndexMap;
//! use restable::dependent::discover;
//! use serde_json::json;
//!
//! let response = json!([{"id": 1}, {"id": 2}]);
//! let mut dependents = IndexMap::new();
//! dependents.insert("/customers/{customerId}/orders".to_string(), "{id}>{customerId}".to_string());
//!
//! let requests = discover(&response, &dependents).unwrap();
//! assert_eq!(requests[1].path().unwrap(), "/customers/2/orders");
//! ```

use crate::address::{value_text, Address, ParameterRecord};
use crate::error::RequestError;
use crate::merge;
use crate::settings::TableSettings;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{([^{}]+)\}").unwrap());

/// A concrete call of an endpoint template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub api_endpoint: String,
    #[serde(default)]
    pub api_endpoint_parameters: ParameterRecord,
}

impl EndpointRequest {
    pub fn new(api_endpoint: impl Into<String>, api_endpoint_parameters: ParameterRecord) -> Self {
        EndpointRequest {
            api_endpoint: api_endpoint.into(),
            api_endpoint_parameters,
        }
    }

    /// The endpoint with every `{name}` placeholder replaced by its parameter
    pub fn path(&self) -> Result<String, RequestError> {
        let template = &self.api_endpoint;
        let mut path = String::with_capacity(template.len());
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .api_endpoint_parameters
                .get(name.as_str())
                .ok_or_else(|| RequestError::MissingParameter {
                    endpoint: template.clone(),
                    parameter: name.as_str().to_string(),
                })?;

            path.push_str(&template[last..whole.start()]);
            path.push_str(&value_text(value));
            last = whole.end();
        }

        path.push_str(&template[last..]);
        Ok(path)
    }

    /// `domain` followed by [`path`](Self::path)
    pub fn url(&self, domain: &str) -> Result<String, RequestError> {
        Ok(format!("{}{}", domain, self.path()?))
    }
}

/// Expand `dependent_requests` (endpoint template → address) over `data`,
/// one request per resolved parameter record, in configuration order.
pub fn discover(
    data: &Value,
    dependent_requests: &IndexMap<String, String>,
) -> Result<Vec<EndpointRequest>, RequestError> {
    let mut requests = Vec::new();

    for (endpoint, raw_address) in dependent_requests {
        let address_error = |source| RequestError::Address {
            endpoint: endpoint.clone(),
            source,
        };

        let address = Address::parse(raw_address).map_err(address_error)?;
        let records = address.resolve(data).map_err(address_error)?;
        debug!(endpoint = %endpoint, requests = records.len(), "discovered dependent requests");

        requests.extend(
            records
                .into_iter()
                .map(|record| EndpointRequest::new(endpoint.clone(), record)),
        );
    }

    Ok(requests)
}

/// Everything configured for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub api_endpoint: String,

    #[serde(default, skip_serializing_if = "ParameterRecord::is_empty")]
    pub api_endpoint_parameters: ParameterRecord,

    /// Passed through to the HTTP layer untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_function_parameters: Option<Value>,

    /// Endpoint template → address of its parameters in this endpoint's response
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependent_requests: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_settings: Option<TableSettings>,

    /// Passed through to the pagination layer untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_settings: Option<Value>,
}

impl EndpointConfig {
    /// Deep-merge `overrides` on top of `defaults` and deserialize the result
    pub fn layered(defaults: &Value, overrides: &Value) -> serde_json::Result<Self> {
        merge::layer(defaults, overrides)
    }

    /// The request this configuration describes
    pub fn request(&self) -> EndpointRequest {
        EndpointRequest::new(self.api_endpoint.clone(), self.api_endpoint_parameters.clone())
    }

    /// Dependent requests found in one of this endpoint's responses
    pub fn discover(&self, response: &Value) -> Result<Vec<EndpointRequest>, RequestError> {
        discover(response, &self.dependent_requests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AddressError;
    use serde_json::json;

    fn dependents(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(e, a)| (e.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn test_discover_mapping_address() {
        let response = json!({
            "data": [
                {"id": "c1", "orders": [{"no": 10}, {"no": 11}]},
                {"id": "c2", "orders": [{"no": 12}]}
            ]
        });
        let config = dependents(&[(
            "/customers/{customerId}/orders/{orderNo}",
            "data.{id}>{customerId}.orders.{no}>{orderNo}",
        )]);

        let requests = discover(&response, &config).unwrap();
        let urls: Vec<String> = requests
            .iter()
            .map(|r| r.url("https://api.example.com").unwrap())
            .collect();

        assert_eq!(
            urls,
            vec![
                "https://api.example.com/customers/c1/orders/10",
                "https://api.example.com/customers/c1/orders/11",
                "https://api.example.com/customers/c2/orders/12",
            ]
        );
        assert_eq!(requests[2].api_endpoint_parameters["customerId"], json!("c2"));
    }

    #[test]
    fn test_discover_keeps_configuration_order() {
        let response = json!({"owner": {"login": "octo"}, "repos": [{"name": "a"}]});
        let config = dependents(&[
            ("/users/{login}", "owner.login"),
            ("/repos/{repo}", "repos.{name}>{repo}"),
        ]);

        let requests = discover(&response, &config).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path().unwrap(), "/users/octo");
        assert_eq!(requests[1].path().unwrap(), "/repos/a");
    }

    #[test]
    fn test_discover_errors() {
        let response = json!({"data": {"id": 1}});

        let err = discover(&response, &dependents(&[("/x/{id}", "data.{id}>{id}")])).unwrap_err();
        assert!(matches!(
            err,
            RequestError::Address { source: AddressError::Resolution { .. }, .. }
        ));

        let request = EndpointRequest::new("/x/{missing}", ParameterRecord::new());
        assert_eq!(
            request.path(),
            Err(RequestError::MissingParameter {
                endpoint: "/x/{missing}".to_string(),
                parameter: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_layered_endpoint_config() {
        let defaults = json!({
            "api_endpoint": "/customers",
            "request_function_parameters": {"headers": {"Accept": "application/json"}},
            "table_settings": {"target_table": "customers", "composite_key": ["id"]}
        });
        let overrides = json!({
            "request_function_parameters": {"headers": {"Authorization": "Bearer t"}},
            "dependent_requests": {"/customers/{cid}": "{id}>{cid}"}
        });

        let config = EndpointConfig::layered(&defaults, &overrides).unwrap();

        assert_eq!(config.api_endpoint, "/customers");
        assert_eq!(
            config.request_function_parameters,
            Some(json!({"headers": {"Accept": "application/json", "Authorization": "Bearer t"}}))
        );
        assert_eq!(config.table_settings.unwrap().target_table, "customers");

        let requests = EndpointConfig::layered(&defaults, &overrides)
            .unwrap()
            .discover(&json!([{"id": 5}]))
            .unwrap();
        assert_eq!(requests[0].path().unwrap(), "/customers/5");
    }
}
