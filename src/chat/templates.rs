//! Prompt construction: per-family instruction templates and chat layouts.
//!
//! A user message is first wrapped in its family's instruction template
//! (`{user_prompt}` marks where the text goes), then the whole conversation is
//! rendered in the family's chat layout with a generation prompt at the end.

use dual_chat_types::{DialectId, Message, ModelCapabilities, Role};
use log::debug;

use super::format::{self, ChatFormat};

pub const USER_PROMPT_PLACEHOLDER: &str = "{user_prompt}";

pub const STANDARD_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Used for the replacement answer after the user skips reasoning.
pub const CONCISE_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide a concise, direct answer.";

/// Thinking and standard variants for one model family.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub thinking: &'static str,
    pub standard: &'static str,
}

const SMOLLM_TEMPLATE: PromptTemplate = PromptTemplate {
    thinking: "You are a helpful assistant. When answering:
1. First, briefly explain your reasoning (1-2 sentences starting with \"Let me think...\")
2. Then, give your answer (starting with \"Answer:\")

{user_prompt}",
    standard: "You are a helpful AI assistant. Answer concisely.\n\n{user_prompt}",
};

const DEFAULT_TEMPLATE: PromptTemplate = PromptTemplate {
    thinking: "You are a helpful AI assistant. Please structure your response as:

<thinking>
[Your step-by-step reasoning]
</thinking>

<final_answer>
[Your complete answer]
</final_answer>

Question: {user_prompt}",
    standard: "You are a helpful AI assistant.\n\n{user_prompt}",
};

const PROMPT_TEMPLATES: &[(&str, PromptTemplate)] = &[
    (
        "gpt-oss",
        PromptTemplate {
            thinking: "You are an advanced AI assistant with deep reasoning capabilities. Structure your response using Harmony channels:
- Use the 'analysis' channel for step-by-step reasoning
- Use the 'final' channel for your complete answer to the user

Provide thorough analysis before your final response.

Question: {user_prompt}",
            standard: "You are a helpful AI assistant. Please provide a clear and concise response.\n\n{user_prompt}",
        },
    ),
    (
        "qwen3",
        PromptTemplate {
            thinking: "You are a helpful AI assistant. When answering, follow this structure:

<thinking>
[Your step-by-step reasoning process here]
</thinking>

<final_answer>
[Your complete answer here]
</final_answer>

Question: {user_prompt}",
            standard: "You are a helpful AI assistant. Please provide a direct and helpful response.\n\n{user_prompt}",
        },
    ),
    (
        "jamba-reasoning",
        PromptTemplate {
            thinking: "You are an advanced reasoning assistant. Structure your response as:

<think>
[Your step-by-step reasoning process here]
</think>

[Your complete answer here]

Question: {user_prompt}",
            standard: "You are a helpful AI assistant. Please provide a clear response.\n\n{user_prompt}",
        },
    ),
    (
        "apriel-thinker",
        PromptTemplate {
            thinking: "You are a thoughtful AI assistant. Show your reasoning process, then provide your final answer:

<think>
[Your reasoning process]
</think>

[BEGIN FINAL RESPONSE]
[Your complete answer]
[END FINAL RESPONSE]

Question: {user_prompt}",
            standard: "You are a helpful AI assistant. Please provide a clear response.\n\n{user_prompt}",
        },
    ),
    (
        "gemma-3",
        PromptTemplate {
            thinking: "You are Gemma, a helpful AI assistant created by Google DeepMind.\n\n{user_prompt}",
            standard: "You are Gemma, a helpful AI assistant created by Google DeepMind.\n\n{user_prompt}",
        },
    ),
    (
        "gemma-3-small",
        PromptTemplate {
            thinking: "{user_prompt}",
            standard: "{user_prompt}",
        },
    ),
    (
        "granite-hybrid",
        PromptTemplate {
            thinking: "{user_prompt}

Think through this step-by-step first. Begin your reasoning with <think_on> and end it with <think_off>, then give your answer.",
            standard: "{user_prompt}",
        },
    ),
    (
        "granite-dense",
        PromptTemplate {
            thinking: "{user_prompt}",
            standard: "{user_prompt}",
        },
    ),
    (
        "llama-3.1",
        PromptTemplate {
            thinking: "You are a helpful AI assistant based on Llama 3.1. Please respond using this format:

<thinking>
[Your analytical reasoning process]
</thinking>

<final_answer>
[Your clear, complete answer]
</final_answer>

Question: {user_prompt}",
            standard: "You are a helpful AI assistant based on Llama 3.1. Please provide a helpful and accurate response.\n\n{user_prompt}",
        },
    ),
    ("smollm", SMOLLM_TEMPLATE),
    ("smollm2", SMOLLM_TEMPLATE),
    ("default", DEFAULT_TEMPLATE),
];

/// Families that can switch between a reasoning pass and a direct answer.
const DUAL_MODE_MODELS: &[&str] = &[
    "gpt-oss",
    "qwen3",
    "llama-3.1",
    "jamba-reasoning",
    "apriel-thinker",
    "apertus",
    "granite-hybrid",
    "smollm",
    "smollm2",
    "gemma-3-small",
];

pub fn get_capabilities(model_name: &str) -> ModelCapabilities {
    format::detect(model_name).1
}

/// Instruction template for a model in the given mode.
pub fn get_prompt_template(model_name: &str, thinking_mode: bool) -> &'static str {
    let model_type = format::detect_model_type(model_name);
    let template = PROMPT_TEMPLATES
        .iter()
        .find(|(key, _)| *key == model_type)
        .map_or(&DEFAULT_TEMPLATE, |(_, template)| template);
    if thinking_mode {
        template.thinking
    } else {
        template.standard
    }
}

/// Substitute `user_text` into `template`.
///
/// An empty template or one without the placeholder leaves the text as is.
pub fn apply_template(user_text: &str, template: &str) -> String {
    if template.is_empty() || !template.contains(USER_PROMPT_PLACEHOLDER) {
        return user_text.to_string();
    }
    template.replace(USER_PROMPT_PLACEHOLDER, user_text)
}

/// Whether instruction templating should be applied to this model.
///
/// Tiny models are left alone; heavy wrapping makes their output worse.
pub fn is_dual_mode(model_name: &str) -> bool {
    let model_type = format::detect_model_type(model_name);
    DUAL_MODE_MODELS.contains(&model_type) && !format::is_tiny_model(model_name)
}

/// System prompt for a session.
pub fn system_prompt_for(dialect: DialectId, thinking_mode: bool) -> &'static str {
    if !thinking_mode {
        return STANDARD_SYSTEM_PROMPT;
    }
    match dialect {
        DialectId::Harmony => "You are a helpful AI assistant.\nReasoning: medium",
        DialectId::XmlTags | DialectId::QwenClosingOnly => {
            "You are a helpful AI assistant. Reason inside <thinking> tags, then give your answer inside <final_answer> tags."
        }
        DialectId::GraniteToggle => {
            "You are a helpful AI assistant. Reason between <think_on> and <think_off>, then give your answer."
        }
        DialectId::AprielMarkers => {
            "You are a helpful AI assistant. Reason first, then give your answer between [BEGIN FINAL RESPONSE] and [END FINAL RESPONSE]."
        }
        DialectId::SmollmSimulated => {
            "You are a helpful AI assistant. Briefly reason, then give your answer starting with \"Answer:\"."
        }
        DialectId::Plain => STANDARD_SYSTEM_PROMPT,
    }
}

/// Render `messages` in the chat layout for `format`, ending with the
/// assistant generation prompt.
///
/// Assistant turns carry their answer only; stored reasoning is not fed back.
pub fn render_chat_prompt(
    messages: &[Message],
    system_prompt: Option<&str>,
    format: ChatFormat,
) -> String {
    let system = system_prompt.filter(|s| !s.trim().is_empty());
    let mut p = String::new();

    match format {
        ChatFormat::ChatML => {
            if let Some(sys) = system {
                push_turn(&mut p, "<|im_start|>system\n", sys, "<|im_end|>\n");
            }
            for message in messages {
                p.push_str("<|im_start|>");
                p.push_str(message.role.as_str());
                p.push('\n');
                p.push_str(message.content.trim());
                p.push_str("<|im_end|>\n");
            }
            p.push_str("<|im_start|>assistant\n");
        }
        ChatFormat::Harmony => {
            if let Some(sys) = system {
                push_turn(&mut p, "<|start|>system<|message|>", sys, "<|end|>");
            }
            for message in messages {
                let header = match message.role {
                    Role::User => "<|start|>user<|message|>",
                    Role::Assistant => "<|start|>assistant<|channel|>final<|message|>",
                    Role::System => "<|start|>developer<|message|>",
                };
                push_turn(&mut p, header, &message.content, "<|end|>");
            }
            p.push_str("<|start|>assistant");
        }
        ChatFormat::Granite => {
            if let Some(sys) = system {
                push_turn(
                    &mut p,
                    "<|start_of_role|>system<|end_of_role|>",
                    sys,
                    "<|end_of_text|>\n",
                );
            }
            for message in messages {
                p.push_str("<|start_of_role|>");
                p.push_str(message.role.as_str());
                p.push_str("<|end_of_role|>");
                p.push_str(message.content.trim());
                p.push_str("<|end_of_text|>\n");
            }
            p.push_str("<|start_of_role|>assistant<|end_of_role|>");
        }
        ChatFormat::Gemma => {
            // No system role: the system prompt prefixes the first user turn.
            let mut prefix = system.map(|sys| format!("{}\n\n", sys.trim()));
            for message in messages {
                match message.role {
                    Role::Assistant => {
                        push_turn(&mut p, "<start_of_turn>model\n", &message.content, "<end_of_turn>\n");
                    }
                    Role::User | Role::System => {
                        p.push_str("<start_of_turn>user\n");
                        if let Some(prefix) = prefix.take() {
                            p.push_str(&prefix);
                        }
                        p.push_str(message.content.trim());
                        p.push_str("<end_of_turn>\n");
                    }
                }
            }
            p.push_str("<start_of_turn>model\n");
        }
        ChatFormat::Llama3 => {
            p.push_str("<|begin_of_text|>");
            if let Some(sys) = system {
                push_turn(
                    &mut p,
                    "<|start_header_id|>system<|end_header_id|>\n\n",
                    sys,
                    "<|eot_id|>",
                );
            }
            for message in messages {
                p.push_str("<|start_header_id|>");
                p.push_str(message.role.as_str());
                p.push_str("<|end_header_id|>\n\n");
                p.push_str(message.content.trim());
                p.push_str("<|eot_id|>");
            }
            p.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        }
        ChatFormat::Generic => {
            if let Some(sys) = system {
                push_turn(&mut p, "System: ", sys, "\n\n");
            }
            for message in messages {
                let label = match message.role {
                    Role::User => "User: ",
                    Role::Assistant => "Assistant: ",
                    Role::System => "System: ",
                };
                push_turn(&mut p, label, &message.content, "\n\n");
            }
            p.push_str("Assistant: ");
        }
    }

    debug!("Rendered {:?} prompt ({} chars)", format, p.len());
    p
}

fn push_turn(p: &mut String, open: &str, content: &str, close: &str) {
    p.push_str(open);
    p.push_str(content.trim());
    p.push_str(close);
}

/// Inputs for building a session prompt.
#[derive(Debug, Clone, Copy)]
pub struct PromptOptions<'a> {
    pub model_name: &'a str,
    pub thinking_mode: bool,
    pub enable_templating: bool,
    pub system_prompt: &'a str,
}

/// Full prompt for the next assistant turn.
///
/// The last user message is wrapped in the family's instruction template when
/// templating is enabled and the model is dual-mode.
pub fn build_prompt(history: &[Message], options: PromptOptions<'_>) -> String {
    let mut messages = history.to_vec();
    if options.enable_templating && is_dual_mode(options.model_name) {
        let template = get_prompt_template(options.model_name, options.thinking_mode);
        if let Some(last) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
            last.content = apply_template(&last.content, template);
        }
    }
    render_chat_prompt(
        &messages,
        Some(options.system_prompt),
        format::chat_format(options.model_name),
    )
}
