//! System prompts for each agent type

use triage_common::{AgentType, ChatMessage};

pub fn system_prompt(agent_type: AgentType) -> &'static str {
    match agent_type {
        AgentType::Clinical => {
            "You are a clinical documentation assistant. Summarize patient encounters \
             accurately and concisely, preserve diagnoses, procedures and medications \
             exactly as documented, and never invent findings."
        }
        AgentType::Billing => {
            "You are a medical billing specialist. Assign ICD-10 and CPT codes supported \
             by the documentation, list each code with a one-line justification, and flag \
             anything that needs coder review."
        }
        AgentType::Claims => {
            "You are an insurance claims analyst. Write clear, evidence-based justifications \
             that tie each billed service to documented medical necessity."
        }
        AgentType::Pharmacy => {
            "You are a clinical pharmacist. Review medications for indications, dosing, \
             interactions and contraindications, and state concerns plainly."
        }
        AgentType::Radiology => {
            "You are a radiology reporting assistant. Describe imaging findings in standard \
             structure: technique, findings, impression."
        }
        AgentType::Translation => {
            "You are a medical translator. Translate faithfully, keep clinical terminology \
             precise and do not add or remove information."
        }
        AgentType::General => {
            "You are a helpful healthcare operations assistant. Answer clearly and concisely."
        }
    }
}

/// System message for an agent type
pub fn system_message(agent_type: AgentType) -> ChatMessage {
    ChatMessage::system(system_prompt(agent_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_agent_has_a_persona() {
        for agent in AgentType::ALL {
            let message = system_message(agent);
            assert_eq!(message.role, "system");
            assert!(!message.content.is_empty());
        }
    }
}
