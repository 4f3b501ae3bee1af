//! Categorization prompt and token estimation
//!
//! Token counts are estimated at roughly four characters per token, plus fixed
//! per-line overhead for the prompt scaffolding.

use crate::models::{Category, TokenEstimate, Transaction};

pub const SYSTEM_PROMPT: &str = "You categorize financial transactions. \
Answer with a JSON array only, no prose.";

/// Characters per token
const CHARS_PER_TOKEN: usize = 4;
/// Instructions and response schema
const BASE_PROMPT_CHARS: usize = 200;
const CATEGORY_LINE_TOKENS: usize = 10;
const TRANSACTION_LINE_TOKENS: usize = 20;
const TRANSACTION_FIELDS_TOKENS: usize = 50;
/// Expected response size per transaction
const OUTPUT_TOKENS_PER_TRANSACTION: usize = 100;

fn tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Estimate input and output tokens for one LLM call
pub fn estimate_tokens(transactions: &[Transaction], categories: &[Category]) -> TokenEstimate {
    let mut input = BASE_PROMPT_CHARS / CHARS_PER_TOKEN;
    for category in categories {
        input += tokens(&category.name) + CATEGORY_LINE_TOKENS;
    }
    for tx in transactions {
        input += tokens(&tx.id.to_string()) + TRANSACTION_LINE_TOKENS;
        input += tokens(tx.description.as_deref().unwrap_or_default());
        input += tokens(tx.merchant_name.as_deref().unwrap_or_default());
        input += TRANSACTION_FIELDS_TOKENS;
    }

    TokenEstimate {
        input_tokens: input as u32,
        output_tokens: (transactions.len() * OUTPUT_TOKENS_PER_TRANSACTION) as u32,
    }
}

/// Prompt overhead not attributable to any transaction, counted once per call
pub fn base_tokens(categories: &[Category]) -> TokenEstimate {
    estimate_tokens(&[], categories)
}

/// Build the user prompt for a batch
pub fn build_prompt(transactions: &[Transaction], categories: &[Category]) -> String {
    let mut prompt = String::from(
        "Assign each transaction below to exactly one of the available categories.\n\n\
         Available categories (id: name):\n",
    );
    for category in categories {
        prompt.push_str(&format!("- {}: {}\n", category.id, category.name));
    }

    prompt.push_str("\nTransactions:\n");
    for tx in transactions {
        prompt.push_str(&format!(
            "- id: {} | date: {} | amount: {:.2} | merchant: {} | description: {}\n",
            tx.id,
            tx.date,
            tx.amount,
            tx.merchant_name.as_deref().unwrap_or("-"),
            tx.description.as_deref().unwrap_or("-"),
        ));
    }

    prompt.push_str(
        "\nRespond with a JSON array containing one object per transaction:\n\
         [{\"transaction_id\": \"<id>\", \"category_id\": <id>, \"category_name\": \"<name>\", \
         \"confidence\": <0.0-1.0>, \"rationale\": \"<short reason>\"}]\n",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn tx(merchant: &str, description: &str) -> Transaction {
        Transaction {
            id: Uuid::nil(),
            organization_id: Uuid::nil(),
            account_name: None,
            amount: -5.75,
            merchant_name: Some(merchant.to_string()),
            description: Some(description.to_string()),
            date: NaiveDate::from_ymd_opt(2024, 4, 2).unwrap(),
            category_id: None,
            metadata: None,
        }
    }

    fn category(id: i64, name: &str) -> Category {
        Category {
            id,
            organization_id: Uuid::nil(),
            name: name.to_string(),
            parent_id: None,
            color: None,
            icon: None,
        }
    }

    #[test]
    fn test_estimate_tokens() {
        // uuid string is 36 chars -> 9 tokens
        let categories = vec![category(1, "Groceries")];
        let estimate = estimate_tokens(&[tx("STARBUCKS", "COFFEE PURCHASE")], &categories);
        let expected_input = 50 + (2 + 10) + (9 + 20 + 3 + 2 + 50);
        assert_eq!(estimate.input_tokens, expected_input);
        assert_eq!(estimate.output_tokens, 100);

        let base = base_tokens(&categories);
        assert_eq!(base.input_tokens, 62);
        assert_eq!(base.output_tokens, 0);
    }

    #[test]
    fn test_prompt_lists_categories_and_transactions() {
        let prompt = build_prompt(
            &[tx("STARBUCKS #4521", "CARD PURCHASE")],
            &[category(7, "Food & Dining")],
        );
        assert!(prompt.contains("- 7: Food & Dining"));
        assert!(prompt.contains(&format!("id: {}", Uuid::nil())));
        assert!(prompt.contains("amount: -5.75"));
        assert!(prompt.contains("merchant: STARBUCKS #4521"));
        assert!(prompt.contains("\"transaction_id\""));
    }
}
