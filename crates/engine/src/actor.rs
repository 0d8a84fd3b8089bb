use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Role of the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Patient,
    Clinician,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "patient" => Ok(Role::Patient),
            "clinician" => Ok(Role::Clinician),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Patient => "patient",
            Role::Clinician => "clinician",
            Role::Admin => "admin",
        })
    }
}

/// The caller as resolved by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub patient_id: String,
    pub role: Role,
}

impl Actor {
    pub fn patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            role: Role::Patient,
        }
    }

    /// Only patients mutate their own assessments.
    pub(crate) fn require_patient(&self) -> Result<(), EngineError> {
        if self.role == Role::Patient {
            Ok(())
        } else {
            Err(EngineError::Forbidden {
                reason: format!("role '{}' may not modify assessments", self.role),
            })
        }
    }

    pub(crate) fn require_owner(&self, owner_patient_id: &str) -> Result<(), EngineError> {
        if self.patient_id == owner_patient_id {
            Ok(())
        } else {
            Err(EngineError::Forbidden {
                reason: "assessment belongs to another patient".to_string(),
            })
        }
    }

    /// Patients read their own assessments; clinicians and admins read any.
    pub(crate) fn require_reader(&self, owner_patient_id: &str) -> Result<(), EngineError> {
        match self.role {
            Role::Patient => self.require_owner(owner_patient_id),
            Role::Clinician | Role::Admin => Ok(()),
        }
    }
}
