use serde::{Deserialize, Serialize};

use super::types::{Member, MemberState};

/// Equality filter for client subscriptions.
///
/// Each set field must equal the member's value. Region and availability
/// zone are matched independently, and a member without a locality never
/// matches a filter that sets either of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_availability_zone(mut self, zone: impl Into<String>) -> Self {
        self.availability_zone = Some(zone.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.service.is_none() && self.region.is_none() && self.availability_zone.is_none()
    }

    pub fn matches_state(&self, state: &MemberState) -> bool {
        if let Some(service) = &self.service
            && *service != state.service
        {
            return false;
        }

        if self.region.is_none() && self.availability_zone.is_none() {
            return true;
        }

        let Some(locality) = &state.locality else {
            return false;
        };

        if let Some(region) = &self.region
            && *region != locality.region
        {
            return false;
        }

        if let Some(zone) = &self.availability_zone
            && *zone != locality.availability_zone
        {
            return false;
        }

        true
    }

    pub fn matches(&self, member: &Member) -> bool {
        self.matches_state(&member.state)
    }
}
