//! Built-in end-markers backed by a [`Driver`].

use crate::config::EndMarkerSpec;
use crate::driver::{Driver, EndMarker};
use crate::model::Locator;
use async_trait::async_trait;
use std::sync::Arc;

/// Satisfied once `locator` no longer matches anything
/// (e.g. a "stop generating" button has gone away).
pub struct Disappeared {
    driver: Arc<dyn Driver>,
    locator: Locator,
}

impl Disappeared {
    pub fn new(driver: Arc<dyn Driver>, locator: impl Into<Locator>) -> Self {
        Self {
            driver,
            locator: locator.into(),
        }
    }
}

#[async_trait]
impl EndMarker for Disappeared {
    fn describe(&self) -> String {
        format!("absent({})", self.locator)
    }

    async fn satisfied(&self) -> bool {
        matches!(self.driver.locate(&self.locator, None).await, Ok(None))
    }
}

/// Satisfied when the element's attribute holds one of the expected values.
pub struct AttributeIn {
    driver: Arc<dyn Driver>,
    locator: Locator,
    name: String,
    one_of: Vec<String>,
}

impl AttributeIn {
    pub fn new(
        driver: Arc<dyn Driver>,
        locator: impl Into<Locator>,
        name: impl Into<String>,
        one_of: Vec<String>,
    ) -> Self {
        Self {
            driver,
            locator: locator.into(),
            name: name.into(),
            one_of,
        }
    }
}

#[async_trait]
impl EndMarker for AttributeIn {
    fn describe(&self) -> String {
        format!("attribute({} @{} in [{}])", self.locator, self.name, self.one_of.join(", "))
    }

    async fn satisfied(&self) -> bool {
        match self.driver.locate(&self.locator, None).await {
            Ok(Some(c)) => c
                .attribute(&self.name)
                .is_some_and(|v| self.one_of.iter().any(|want| want == v)),
            _ => false,
        }
    }
}

/// Satisfied when the element exists and has non-empty text.
pub struct TextPresent {
    driver: Arc<dyn Driver>,
    locator: Locator,
}

impl TextPresent {
    pub fn new(driver: Arc<dyn Driver>, locator: impl Into<Locator>) -> Self {
        Self {
            driver,
            locator: locator.into(),
        }
    }
}

#[async_trait]
impl EndMarker for TextPresent {
    fn describe(&self) -> String {
        format!("text_present({})", self.locator)
    }

    async fn satisfied(&self) -> bool {
        matches!(
            self.driver.locate(&self.locator, None).await,
            Ok(Some(c)) if !c.text.trim().is_empty()
        )
    }
}

/// Turn a config spec into a live marker.
pub fn build(spec: &EndMarkerSpec, driver: Arc<dyn Driver>) -> Arc<dyn EndMarker> {
    match spec {
        EndMarkerSpec::Absent(l) => Arc::new(Disappeared::new(driver, l.clone())),
        EndMarkerSpec::Attribute { locator, name, one_of } => {
            Arc::new(AttributeIn::new(driver, locator.clone(), name.clone(), one_of.clone()))
        }
        EndMarkerSpec::TextPresent(l) => Arc::new(TextPresent::new(driver, l.clone())),
    }
}

pub fn build_all(specs: &[EndMarkerSpec], driver: &Arc<dyn Driver>) -> Vec<Arc<dyn EndMarker>> {
    specs.iter().map(|s| build(s, driver.clone())).collect()
}
