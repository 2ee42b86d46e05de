//! Prompts for every backend call the pipeline makes.
//!
//! All prompt text lives here so the pipeline modules only deal with
//! sequencing, parsing and state. Tests inspect the builders directly.
//!
//! Callers can override the archivist system prompt via
//! [`crate::config::PipelineConfig::system_prompt`].

/// Default system prompt for page and component transcription.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert digital archivist specializing in mathematical and scientific texts. \
Your task is to perform high-fidelity Optical Character Recognition (OCR) and document layout analysis, \
converting physical pages into perfectly structured Markdown documents with accurate LaTeX formatting.";

/// Worked example embedded in whole-page transcription prompts.
pub const WORKED_EXAMPLE: &str = r#"### Example Inline Mathematical Formula

This is an example of an inline mathematical formula: $E=mc^2$.

### Example Block Mathematical Formula

This is an example of a block mathematical formula:

$$
\int_0^1 x^2 \, dx = \frac{1}{3}
$$

### Example of a Table

| Header 1 | Header 2 | Header 3 |
|----------|----------|----------|
| Row 1 Col 1 | Row 1 Col 2 | Row 1 Col 3 |
| Row 2 Col 1 | Row 2 Col 2 | Row 2 Col 3 |

### Example of a Figure Caption

**Figure 1.1: A caption is transcribed as bold text directly below where the figure appears.**"#;

const OUTPUT_RULES: &str = "Output ONLY the Markdown content of the page. \
Do NOT wrap it in ```markdown fences and do NOT add commentary. \
Use $...$ for inline math and $$...$$ for display math. \
Choose heading levels so they continue the document context given above.";

/// Whole-page transcription prompt used in basic mode.
pub fn basic_prompt(context_block: &str) -> String {
    format!(
        "{context_block}\n\
Your task is to transcribe the provided page into a clean Markdown document with perfect LaTeX formatting.\n\
Here is an example of the quality and format required:\n\
--- EXAMPLE START ---\n\
{WORKED_EXAMPLE}\n\
--- EXAMPLE END ---\n\
{OUTPUT_RULES}"
    )
}

/// First refine pass: free-form structural observations about the page.
pub fn analysis_prompt(context_block: &str) -> String {
    format!(
        "{context_block}\n\
Analyze the layout of this page by following these steps:\n\
1. **Overall Layout**: identify the overall layout. Is it single-column, two-column, or something more complex?\n\
2. **Component Identification**: locate and identify all distinct components: headers, footers, main text body, figures, tables, and most importantly, mathematical formula blocks.\n\
3. **Challenge Assessment**: note any potential challenges for transcription, such as small font sizes, complex nested formulas, or unusual text flow.\n\
Provide your analysis as a concise JSON object, focusing only on the structural facts."
    )
}

/// Second refine pass: transcription guided by the worked example and the
/// page's cached analysis.
pub fn refined_prompt(context_block: &str, analysis_text: &str) -> String {
    format!(
        "{context_block}\n\
You will perform a highly accurate transcription of the provided page.\n\
First, study this example:\n\
--- EXAMPLE START ---\n\
{WORKED_EXAMPLE}\n\
--- EXAMPLE END ---\n\
Next, study this analysis of the page:\n\
--- ANALYSIS ---\n\
{analysis_text}\n\
--- END ANALYSIS ---\n\
Considering both, transcribe the entire page.\n\
{OUTPUT_RULES}"
    )
}

/// Layout segmentation prompt for structured mode.
pub const LAYOUT_ANALYSIS_PROMPT: &str = r#"You are an expert document layout analyzer. Your task is to analyze the provided image of a page from a scientific book.
Identify all distinct logical components on the page. For each component, provide its type and its precise bounding box coordinates `[x_min, y_min, x_max, y_max]` in pixels of the provided image.
Also, determine the primary language of the document.

The component types must be one of the following:
- `text_block`: A standard paragraph of text.
- `formula_block`: A block containing one or more mathematical formulas, usually displayed on its own lines.
- `figure`: An image, diagram, or chart.
- `caption`: The text description for a figure.
- `header`: The page header (e.g., page number, chapter title).
- `footer`: The page footer.

Your output MUST be a single, valid JSON object following this exact schema. Do not add any other text or explanations.

```json
{
  "language": "english",
  "components": [
    {"type": "header", "box": [50, 50, 950, 100]},
    {"type": "text_block", "box": [100, 120, 900, 500]},
    {"type": "figure", "box": [200, 520, 800, 800]}
  ]
}
```"#;

/// Per-component transcription instruction.
pub const COMPONENT_OCR_PROMPT: &str = "You are a highly specialized OCR engine. \
You will be given a small, pre-cropped image of a single document component.\n\
Transcribe the content of this image with maximum accuracy.\n\
- For text, output the plain text.\n\
- For mathematical formulas, use proper LaTeX syntax delimited by $...$ or $$...$$.\n\
Your output should be ONLY the transcribed content, with no extra explanations.";

/// System prompt for the reassembly call.
pub const REASSEMBLY_SYSTEM_PROMPT: &str =
    "You are an expert technical editor who reconstructs pages of scientific documents.";

/// Reassembly prompt: order the page's components by meaning, not position.
pub fn reassembly_prompt(language: &str, direction_tag: &str, components_json: &str) -> String {
    format!(
        r#"Your task is to reconstruct a page from a scientific document using a list of disordered content components.

### CONTEXT
- The document language is: **{language}**
- The standard reading direction is: **{direction_tag}** (This is a general rule, but logical connection is more important).

### INPUT DATA (List of Document Components)
Each component has an id, a type, a bounding box (a hint for position) and its transcribed content.
```json
{components_json}
```

### YOUR TASK
1. Analyze the `content` of all components to understand their logical relationships.
2. Determine the most natural reading order that forms a coherent, logical flow.
3. **PRIORITIZE SEMANTIC CONNECTION OVER POSITION.** A sentence fragment in one block should be followed by its continuation in another, regardless of their `box` coordinates. A figure's caption should follow the figure or its reference.
4. Your final output MUST be a single JSON array containing every component `id` exactly once, in the correct logical order.

### OUTPUT FORMAT EXAMPLE
["comp_01", "comp_03", "comp_02", "comp_05", "comp_04"]"#
    )
}

/// System prompt for translating committed Markdown.
pub fn translation_system_prompt(target_language: &str) -> String {
    format!(
        "You are a professional translator. Translate the Markdown document you are given \
         into natural, fluent {target_language}. Preserve the Markdown syntax completely: \
         headings, lists, links, image references, tables, code blocks and $...$ or $$...$$ \
         math must come through unchanged apart from their translated text. \
         Return only the translated Markdown."
    )
}

/// Prompt used for the startup connectivity check.
pub const PING_PROMPT: &str = "Reply with the single word: ready";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_prompt_embeds_context_and_example() {
        let p = basic_prompt("--- DOCUMENT CONTEXT ---\nCurrent Heading Depth: 2");
        assert!(p.starts_with("--- DOCUMENT CONTEXT ---"));
        assert!(p.contains("Current Heading Depth: 2"));
        assert!(p.contains("--- EXAMPLE START ---"));
        assert!(p.contains(WORKED_EXAMPLE));
    }

    #[test]
    fn refined_prompt_embeds_analysis_text() {
        let p = refined_prompt("ctx", r#"{"layout": "two-column"}"#);
        assert!(p.contains(r#"{"layout": "two-column"}"#));
        assert!(p.contains("--- ANALYSIS ---"));
        assert!(p.contains(WORKED_EXAMPLE));
        assert!(!p.contains("{analysis_text}"));
    }

    #[test]
    fn reassembly_prompt_lists_components() {
        let p = reassembly_prompt("english", "LRTB", r#"[{"id": "comp_01"}]"#);
        assert!(p.contains("**english**"));
        assert!(p.contains("**LRTB**"));
        assert!(p.contains(r#"[{"id": "comp_01"}]"#));
    }

    #[test]
    fn translation_prompt_names_target_language() {
        let p = translation_system_prompt("French");
        assert!(p.contains("fluent French."));
        assert!(p.contains("code blocks"));
    }

    #[test]
    fn worked_example_uses_dollar_math() {
        assert!(WORKED_EXAMPLE.contains("$E=mc^2$"));
        assert!(!WORKED_EXAMPLE.contains("```math"));
    }
}
