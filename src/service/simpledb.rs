//! Amazon SimpleDB client, used as a tiny key/attribute store

use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;

use super::aws::{self, classify_transport, send, sign_v2, xml_elements, xml_unescape, Credentials};
use super::{Attribute, AttributeStore};
use crate::error::ServiceError;

const API_VERSION: &str = "2009-04-15";

pub struct SimpleDbClient {
    http: Client,
    creds: Credentials,
    host: String,
    domain: String,
}

impl SimpleDbClient {
    pub fn new(region: &str, domain: &str, creds: Credentials) -> Result<Self, ServiceError> {
        let host = if region == "us-east-1" {
            "sdb.amazonaws.com".to_string()
        } else {
            format!("sdb.{region}.amazonaws.com")
        };
        Ok(Self {
            http: aws::http_client()?,
            creds,
            host,
            domain: domain.to_string(),
        })
    }

    /// POST one signed query action and return the XML response body
    fn call(&self, action: &str, mut params: Vec<(String, String)>) -> Result<String, ServiceError> {
        params.push(("Action".into(), action.into()));
        params.push(("Version".into(), API_VERSION.into()));
        let body = sign_v2(&self.creds, &self.host, &mut params, Utc::now());
        let req = self
            .http
            .post(format!("https://{}/", self.host))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded; charset=utf-8")
            .body(body);
        send(action, req)?
            .text()
            .map_err(|e| classify_transport(action, e))
    }

    fn item_params(&self, key: &str) -> Vec<(String, String)> {
        vec![
            ("DomainName".into(), self.domain.clone()),
            ("ItemName".into(), key.into()),
        ]
    }
}

fn parse_attributes(doc: &str) -> Vec<Attribute> {
    xml_elements(doc, "Attribute")
        .into_iter()
        .filter_map(|block| {
            let name = xml_elements(block, "Name").first().copied()?;
            let value = xml_elements(block, "Value").first().copied().unwrap_or("");
            Some(Attribute::new(xml_unescape(name), xml_unescape(value)))
        })
        .collect()
}

impl AttributeStore for SimpleDbClient {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn list_domains(&self) -> Result<Vec<String>, ServiceError> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params = vec![("MaxNumberOfDomains".to_string(), "100".to_string())];
            if let Some(t) = &token {
                params.push(("NextToken".into(), t.clone()));
            }
            let doc = self.call("ListDomains", params)?;
            names.extend(
                xml_elements(&doc, "DomainName")
                    .into_iter()
                    .map(xml_unescape),
            );
            match xml_elements(&doc, "NextToken").first() {
                Some(t) if !t.is_empty() => token = Some(xml_unescape(t)),
                _ => break,
            }
        }
        Ok(names)
    }

    fn create_domain(&self, name: &str) -> Result<(), ServiceError> {
        self.call(
            "CreateDomain",
            vec![("DomainName".into(), name.to_string())],
        )?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<Attribute>, ServiceError> {
        let mut params = self.item_params(key);
        params.push(("ConsistentRead".into(), "true".into()));
        let doc = self.call("GetAttributes", params)?;
        Ok(parse_attributes(&doc))
    }

    /// PutAttributes only replaces the names it lists, so stale names are deleted afterwards
    fn set(&self, key: &str, attributes: &[Attribute]) -> Result<(), ServiceError> {
        let existing = self.get(key)?;

        if !attributes.is_empty() {
            let mut params = self.item_params(key);
            for (i, attr) in attributes.iter().enumerate() {
                let n = i + 1;
                params.push((format!("Attribute.{n}.Name"), attr.name.clone()));
                params.push((format!("Attribute.{n}.Value"), attr.value.clone()));
                params.push((format!("Attribute.{n}.Replace"), "true".into()));
            }
            self.call("PutAttributes", params)?;
        }

        let mut stale: Vec<&str> = existing
            .iter()
            .map(|a| a.name.as_str())
            .filter(|name| !attributes.iter().any(|a| a.name == *name))
            .collect();
        stale.sort_unstable();
        stale.dedup();
        if !stale.is_empty() {
            let mut params = self.item_params(key);
            for (i, name) in stale.iter().enumerate() {
                params.push((format!("Attribute.{}.Name", i + 1), name.to_string()));
            }
            self.call("DeleteAttributes", params)?;
        }
        Ok(())
    }
}
