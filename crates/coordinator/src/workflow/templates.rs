//! Named workflow templates
//!
//! Each template is a pure function of the request context: it lays out the
//! agent tasks, their dependencies and the report sections they fill.

use super::{AgentTask, WorkflowContext, WorkflowType};
use triage_common::AgentType;

/// Task graph plus report layout for a named workflow
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    pub title: &'static str,
    pub tasks: Vec<AgentTask>,
    /// `(task name, section header)` in report order
    pub sections: Vec<(&'static str, &'static str)>,
}

fn field<'a>(context: &'a WorkflowContext, key: &str) -> &'a str {
    context
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or("Not provided")
}

/// Template for `workflow_type`, `None` for custom workflows
pub fn template(workflow_type: WorkflowType, context: &WorkflowContext) -> Option<WorkflowTemplate> {
    match workflow_type {
        WorkflowType::DischargeSummary => Some(discharge_summary(context)),
        WorkflowType::ClaimsJustification => Some(claims_justification(context)),
        WorkflowType::MedicationReview => Some(medication_review(context)),
        WorkflowType::PriorAuthorization => Some(prior_authorization(context)),
        WorkflowType::Custom => None,
    }
}

pub fn discharge_summary(context: &WorkflowContext) -> WorkflowTemplate {
    let patient = field(context, "patient_info");
    let notes = field(context, "clinical_notes");

    WorkflowTemplate {
        title: "Discharge Summary",
        tasks: vec![
            AgentTask::new(
                "clinical_summary",
                AgentType::Clinical,
                format!(
                    "Write a discharge summary covering admission reason, hospital course, \
                     discharge condition and follow-up.\n\nPatient: {}\n\nClinical notes:\n{}",
                    patient, notes
                ),
            )
            .with_generation(1024, 0.3),
            AgentTask::new(
                "billing_codes",
                AgentType::Billing,
                format!(
                    "Suggest ICD-10 diagnosis and CPT procedure codes for this stay.\n\n\
                     Diagnoses: {}\nProcedures: {}\n\nClinical notes:\n{}",
                    field(context, "diagnosis"),
                    field(context, "procedures"),
                    notes
                ),
            )
            .with_generation(512, 0.1),
        ],
        sections: vec![
            ("clinical_summary", "Clinical Summary"),
            ("billing_codes", "Billing Codes"),
        ],
    }
}

pub fn claims_justification(context: &WorkflowContext) -> WorkflowTemplate {
    WorkflowTemplate {
        title: "Claims Justification",
        tasks: vec![
            AgentTask::new(
                "drug_analysis",
                AgentType::Pharmacy,
                format!(
                    "Analyze the prescribed therapy: indication, dosing and alternatives tried.\n\n\
                     Medication: {}\nDiagnosis: {}",
                    field(context, "medication"),
                    field(context, "diagnosis")
                ),
            ),
            AgentTask::new(
                "billing",
                AgentType::Billing,
                format!(
                    "Produce the billing codes for this claim using the drug analysis above.\n\n\
                     Procedures: {}",
                    field(context, "procedures")
                ),
            )
            .depends_on(&["drug_analysis"])
            .with_generation(512, 0.1),
            AgentTask::new(
                "justification",
                AgentType::Claims,
                format!(
                    "Write the medical necessity justification for payer {} using the analysis \
                     and codes above.\n\nPatient: {}",
                    field(context, "insurance"),
                    field(context, "patient_info")
                ),
            )
            .depends_on(&["drug_analysis", "billing"])
            .with_generation(1024, 0.3),
        ],
        sections: vec![
            ("drug_analysis", "Drug Analysis"),
            ("billing", "Billing"),
            ("justification", "Medical Necessity Justification"),
        ],
    }
}

pub fn medication_review(context: &WorkflowContext) -> WorkflowTemplate {
    let medications = field(context, "medications");

    WorkflowTemplate {
        title: "Medication Review",
        tasks: vec![
            AgentTask::new(
                "interaction_check",
                AgentType::Pharmacy,
                format!(
                    "Check this medication list for drug-drug interactions and \
                     contraindications.\n\nMedications:\n{}\n\nAllergies: {}",
                    medications,
                    field(context, "allergies")
                ),
            )
            .with_generation(768, 0.2),
            AgentTask::new(
                "dosing_review",
                AgentType::Pharmacy,
                format!(
                    "Review dosing against patient factors.\n\nMedications:\n{}\n\nPatient: {}",
                    medications,
                    field(context, "patient_info")
                ),
            )
            .with_generation(768, 0.2),
            AgentTask::new(
                "patient_instructions",
                AgentType::General,
                "Write plain-language medication instructions for the patient based on the \
                 reviews above."
                    .to_string(),
            )
            .depends_on(&["interaction_check", "dosing_review"]),
        ],
        sections: vec![
            ("interaction_check", "Interactions"),
            ("dosing_review", "Dosing"),
            ("patient_instructions", "Patient Instructions"),
        ],
    }
}

pub fn prior_authorization(context: &WorkflowContext) -> WorkflowTemplate {
    let treatment = field(context, "treatment_plan");

    WorkflowTemplate {
        title: "Prior Authorization Request",
        tasks: vec![
            AgentTask::new(
                "clinical_necessity",
                AgentType::Clinical,
                format!(
                    "Summarize the clinical evidence supporting this treatment.\n\n\
                     Treatment: {}\nDiagnosis: {}\n\nClinical notes:\n{}",
                    treatment,
                    field(context, "diagnosis"),
                    field(context, "clinical_notes")
                ),
            ),
            AgentTask::new(
                "coding",
                AgentType::Billing,
                format!("Provide the codes for the requested treatment.\n\nTreatment: {}", treatment),
            )
            .with_generation(256, 0.1),
            AgentTask::new(
                "authorization_request",
                AgentType::Claims,
                format!(
                    "Draft the prior authorization request to {} from the evidence and codes above.",
                    field(context, "insurance")
                ),
            )
            .depends_on(&["clinical_necessity", "coding"])
            .with_generation(1024, 0.3),
        ],
        sections: vec![
            ("clinical_necessity", "Clinical Necessity"),
            ("coding", "Requested Codes"),
            ("authorization_request", "Authorization Request"),
        ],
    }
}
