//! Metric catalogue: value kinds and nested structures for the published metrics.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

/// Columns that describe a record rather than a measured value.
pub const BASE_METRICS: [&str; 4] = ["areaType", "areaCode", "areaName", "date"];

/// How values of a metric are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Integer,
    Float,
    Text,
    Nested,
}

const INTEGER_METRICS: &[&str] = &[
    "VaccineRegisterPopulationByVaccinationDate",
    "alertLevel",
    "capacityPillarFour",
    "capacityPillarOne",
    "capacityPillarOneTwo",
    "capacityPillarOneTwoFour",
    "capacityPillarThree",
    "capacityPillarTwo",
    "changeInNewCasesBySpecimenDate",
    "covidOccupiedMVBeds",
    "cumAdmissions",
    "cumAntibodyTestsByPublishDate",
    "cumCasesByPublishDate",
    "cumCasesBySpecimenDate",
    "cumCasesLFDConfirmedPCRBySpecimenDate",
    "cumCasesLFDOnlyBySpecimenDate",
    "cumCasesPCROnlyBySpecimenDate",
    "cumDailyNsoDeathsByDeathDate",
    "cumDeaths28DaysByDeathDate",
    "cumDeaths28DaysByPublishDate",
    "cumDeaths60DaysByDeathDate",
    "cumDeaths60DaysByPublishDate",
    "cumDeathsByDeathDate",
    "cumDeathsByPublishDate",
    "cumLFDTestsBySpecimenDate",
    "cumOnsDeathsByRegistrationDate",
    "cumPCRTestsByPublishDate",
    "cumPCRTestsBySpecimenDate",
    "cumPeopleReceivingFirstDose",
    "cumPeopleReceivingSecondDose",
    "cumPeopleVaccinatedBoosterDoseByPublishDate",
    "cumPeopleVaccinatedCompleteByPublishDate",
    "cumPeopleVaccinatedCompleteByVaccinationDate",
    "cumPeopleVaccinatedFirstDoseByPublishDate",
    "cumPeopleVaccinatedFirstDoseByVaccinationDate",
    "cumPeopleVaccinatedSecondDoseByPublishDate",
    "cumPeopleVaccinatedSecondDoseByVaccinationDate",
    "cumPeopleVaccinatedThirdDoseByPublishDate",
    "cumPeopleVaccinatedThirdInjectionByPublishDate",
    "cumPeopleVaccinatedThirdInjectionByVaccinationDate",
    "cumPillarFourTestsByPublishDate",
    "cumPillarOneTestsByPublishDate",
    "cumPillarOneTwoTestsByPublishDate",
    "cumPillarThreeTestsByPublishDate",
    "cumPillarTwoTestsByPublishDate",
    "cumTestsByPublishDate",
    "cumVaccinesGivenByPublishDate",
    "cumVirusTestsByPublishDate",
    "cumVirusTestsBySpecimenDate",
    "cumWeeklyNsoCareHomeDeathsByRegDate",
    "cumWeeklyNsoDeathsByRegDate",
    "hospitalCases",
    "newAdmissions",
    "newAdmissionsChange",
    "newAdmissionsRollingSum",
    "newAntibodyTestsByPublishDate",
    "newCasesByPublishDate",
    "newCasesByPublishDateChange",
    "newCasesByPublishDateRollingSum",
    "newCasesBySpecimenDate",
    "newCasesBySpecimenDateChange",
    "newCasesBySpecimenDateRollingSum",
    "newCasesLFDConfirmedPCRBySpecimenDate",
    "newCasesLFDConfirmedPCRBySpecimenDateRollingSum",
    "newCasesLFDOnlyBySpecimenDate",
    "newCasesLFDOnlyBySpecimenDateRollingSum",
    "newCasesPCROnlyBySpecimenDate",
    "newCasesPCROnlyBySpecimenDateRollingSum",
    "newDailyNsoDeathsByDeathDate",
    "newDeaths28DaysByDeathDate",
    "newDeaths28DaysByDeathDateRollingSum",
    "newDeaths28DaysByPublishDate",
    "newDeaths28DaysByPublishDateChange",
    "newDeaths28DaysByPublishDateRollingSum",
    "newDeaths60DaysByDeathDate",
    "newDeaths60DaysByDeathDateRollingSum",
    "newDeaths60DaysByPublishDate",
    "newDeathsByDeathDate",
    "newDeathsByDeathDateRollingSum",
    "newDeathsByPublishDate",
    "newLFDTestsBySpecimenDate",
    "newOnsDeathsByRegistrationDate",
    "newPCRTestsByPublishDate",
    "newPCRTestsByPublishDateChange",
    "newPCRTestsByPublishDateRollingSum",
    "newPCRTestsBySpecimenDate",
    "newPeopleReceivingFirstDose",
    "newPeopleReceivingSecondDose",
    "newPeopleVaccinatedBoosterDoseByPublishDate",
    "newPeopleVaccinatedCompleteByPublishDate",
    "newPeopleVaccinatedCompleteByVaccinationDate",
    "newPeopleVaccinatedFirstDoseByPublishDate",
    "newPeopleVaccinatedFirstDoseByVaccinationDate",
    "newPeopleVaccinatedSecondDoseByPublishDate",
    "newPeopleVaccinatedSecondDoseByVaccinationDate",
    "newPeopleVaccinatedThirdDoseByPublishDate",
    "newPeopleVaccinatedThirdInjectionByPublishDate",
    "newPeopleVaccinatedThirdInjectionByVaccinationDate",
    "newPillarFourTestsByPublishDate",
    "newPillarOneTestsByPublishDate",
    "newPillarOneTwoTestsByPublishDate",
    "newPillarThreeTestsByPublishDate",
    "newPillarTwoTestsByPublishDate",
    "newTestsByPublishDate",
    "newVaccinesGivenByPublishDate",
    "newVirusTestsByPublishDate",
    "newVirusTestsBySpecimenDate",
    "newVirusTestsChange",
    "newVirusTestsRollingSum",
    "newWeeklyNsoCareHomeDeathsByRegDate",
    "newWeeklyNsoDeathsByRegDate",
    "plannedAntibodyCapacityByPublishDate",
    "plannedCapacityByPublishDate",
    "plannedPCRCapacityByPublishDate",
    "previouslyReportedNewCasesBySpecimenDate",
    "uniquePeopleTestedBySpecimenDateRollingSum",
    "weeklyPeopleVaccinatedFirstDoseByVaccinationDate",
    "weeklyPeopleVaccinatedSecondDoseByVaccinationDate",
];

const TEXT_METRICS: &[&str] = &[
    "newAdmissionsDirection",
    "newCasesByPublishDateDirection",
    "newCasesBySpecimenDateDirection",
    "newDeaths28DaysByPublishDateDirection",
    "newPCRTestsByPublishDateDirection",
    "newVirusTestsDirection",
];

const JSON_METRICS: &[&str] = &[
    "cumAdmissionsByAge",
    "femaleCases",
    "femaleDeaths28Days",
    "maleCases",
    "maleDeaths28Days",
    "newCasesByPublishDateAgeDemographics",
    "newCasesBySpecimenDateAgeDemographics",
    "newDeaths28DaysByDeathDateAgeDemographics",
    "vaccinationsAgeDemographics",
];

const NESTED_STRUCTURES: &[(&str, &[&str])] = &[
    ("cumAdmissionsByAge", &["age", "rate", "value"]),
    ("femaleCases", &["age", "rate", "value"]),
    ("maleCases", &["age", "rate", "value"]),
    (
        "newCasesByPublishDateAgeDemographics",
        &["age", "cases", "rollingSum", "rollingRate"],
    ),
    (
        "newCasesBySpecimenDateAgeDemographics",
        &["age", "cases", "rollingSum", "rollingRate"],
    ),
    (
        "newDeaths28DaysByDeathDateAgeDemographics",
        &["age", "deaths", "rollingSum", "rollingRate"],
    ),
];

static INTEGERS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| INTEGER_METRICS.iter().copied().collect());
static TEXTS: Lazy<HashSet<&'static str>> = Lazy::new(|| TEXT_METRICS.iter().copied().collect());
static JSON: Lazy<HashSet<&'static str>> = Lazy::new(|| JSON_METRICS.iter().copied().collect());
static STRUCTURES: Lazy<HashMap<&'static str, &'static [&'static str]>> =
    Lazy::new(|| NESTED_STRUCTURES.iter().copied().collect());

/// Kind of a metric; names missing from the catalogue are treated as floats.
pub fn kind_of(metric: &str) -> MetricKind {
    if JSON.contains(metric) {
        MetricKind::Nested
    } else if INTEGERS.contains(metric) {
        MetricKind::Integer
    } else if TEXTS.contains(metric) || BASE_METRICS.contains(&metric) {
        MetricKind::Text
    } else {
        MetricKind::Float
    }
}

pub fn is_base_metric(metric: &str) -> bool {
    BASE_METRICS.contains(&metric)
}

/// Element fields of a nested metric, in output order, when the structure is published.
pub fn nested_fields(metric: &str) -> Option<&'static [&'static str]> {
    STRUCTURES.get(metric).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_kinds() {
        assert_eq!(kind_of("newCasesByPublishDate"), MetricKind::Integer);
        assert_eq!(kind_of("cumCasesByPublishDateRate"), MetricKind::Float);
        assert_eq!(kind_of("newAdmissionsDirection"), MetricKind::Text);
        assert_eq!(kind_of("maleCases"), MetricKind::Nested);
        assert_eq!(kind_of("somethingUnpublished"), MetricKind::Float);
    }

    #[test]
    fn nested_structures_are_known() {
        assert_eq!(
            nested_fields("cumAdmissionsByAge"),
            Some(&["age", "rate", "value"][..])
        );
        assert!(nested_fields("newCasesByPublishDate").is_none());
        assert_eq!(kind_of("maleDeaths28Days"), MetricKind::Nested);
        assert!(nested_fields("maleDeaths28Days").is_none());
    }
}
