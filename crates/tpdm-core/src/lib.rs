//! Core domain model for the TPDM teacher candidate connector.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "tpdm-core";

/// Coded-value vocabularies the remote store resolves to namespaced URIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Vocabulary {
    AddressType,
    Locale,
    StateAbbreviation,
    AcademicSubject,
    GradeLevel,
    TppDegreeType,
    Sex,
}

impl Vocabulary {
    pub const ALL: [Vocabulary; 7] = [
        Vocabulary::AddressType,
        Vocabulary::Locale,
        Vocabulary::StateAbbreviation,
        Vocabulary::AcademicSubject,
        Vocabulary::GradeLevel,
        Vocabulary::TppDegreeType,
        Vocabulary::Sex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Vocabulary::AddressType => "addressType",
            Vocabulary::Locale => "locale",
            Vocabulary::StateAbbreviation => "stateAbbreviation",
            Vocabulary::AcademicSubject => "academicSubject",
            Vocabulary::GradeLevel => "gradeLevel",
            Vocabulary::TppDegreeType => "tppDegreeType",
            Vocabulary::Sex => "sex",
        }
    }

    /// Resource path of the descriptor catalog, relative to the API base URL.
    pub fn resource_path(self) -> &'static str {
        match self {
            Vocabulary::AddressType => "ed-fi/addressTypeDescriptors",
            Vocabulary::Locale => "ed-fi/localeDescriptors",
            Vocabulary::StateAbbreviation => "ed-fi/stateAbbreviationDescriptors",
            Vocabulary::AcademicSubject => "ed-fi/academicSubjectDescriptors",
            Vocabulary::GradeLevel => "ed-fi/gradeLevelDescriptors",
            Vocabulary::TppDegreeType => "tpdm/tppDegreeTypeDescriptors",
            Vocabulary::Sex => "ed-fi/sexDescriptors",
        }
    }
}

impl fmt::Display for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a remote descriptor catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorEntry {
    pub code_value: String,
    pub namespace: String,
}

impl DescriptorEntry {
    pub fn uri(&self) -> String {
        format!("{}#{}", self.namespace, self.code_value)
    }
}

/// Business id / remote id pair listed from the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCandidateRef {
    pub id: String,
    pub teacher_candidate_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReference {
    pub student_unique_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramDegree {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub academic_subject_descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_level_descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tpp_degree_type_descriptor: Option<String>,
}

/// Validity period of an address. Two periods are duplicates when both bounds match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressPeriod {
    pub begin_date: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateAddress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_type_descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale_descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_abbreviation_descriptor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apartment_room_suite_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_site_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congressional_district: Option<String>,
    #[serde(rename = "countyFIPSCode", skip_serializing_if = "Option::is_none")]
    pub county_fips_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_not_publish_indicator: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_of_county: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub street_number_name: Option<String>,
    pub periods: Vec<AddressPeriod>,
}

impl CandidateAddress {
    /// Street, city, state and postal code identify a physical address.
    /// Descriptor and flag fields do not take part; comparison is exact.
    pub fn same_location(&self, other: &CandidateAddress) -> bool {
        self.street_number_name == other.street_number_name
            && self.city == other.city
            && self.state_abbreviation_descriptor == other.state_abbreviation_descriptor
            && self.postal_code == other.postal_code
    }

    /// Append a period unless an identical one is already listed.
    /// Returns whether the list changed.
    pub fn push_period(&mut self, period: AddressPeriod) -> bool {
        if self.periods.contains(&period) {
            return false;
        }
        self.periods.push(period);
        true
    }
}

/// Add `address` to `addresses`, folding its periods into an existing entry
/// for the same location. First-seen order is kept for both addresses and periods.
pub fn add_or_merge(addresses: &mut Vec<CandidateAddress>, address: CandidateAddress) {
    if let Some(existing) = addresses.iter_mut().find(|a| a.same_location(&address)) {
        for period in address.periods {
            existing.push_period(period);
        }
        return;
    }
    addresses.push(address);
}

/// Canonical teacher candidate payload submitted to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherCandidate {
    pub teacher_candidate_identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub middle_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_surname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sex_descriptor: Option<String>,
    pub student_reference: StudentReference,
    pub tpp_program_degrees: Vec<ProgramDegree>,
    #[serde(default)]
    pub addresses: Vec<CandidateAddress>,
}

impl TeacherCandidate {
    pub fn student_unique_id(&self) -> Option<&str> {
        self.student_reference.student_unique_id.as_deref()
    }
}
