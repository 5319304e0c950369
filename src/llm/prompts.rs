//! Instruction templates and response schemas for the four pipeline stages.
//!
//! Each template names the exact fields it wants back and forbids prose. The
//! `*_MARKER` phrases are stable so mock and fixture clients can recognise the
//! stage a request belongs to.

use serde_json::{json, Value};

use super::client::{ChatMessage, CompletionRequest, ResponseSchema};
use crate::pipeline::project_root;
use crate::pipeline::records::{TechStack, TestableUnit, UnitKind};

pub const STACK_MARKER: &str = "identify the programming languages and frameworks";
pub const UNITS_MARKER: &str = "identify functions or classes that require testing";
pub const CASES_MARKER: &str = "Generate possible test cases";
pub const CODE_MARKER: &str = "Generate unit tests for the function";

/// Stand-in requirement text when no requirements document was supplied.
pub const NO_REQUIREMENTS: &str =
    "No requirements document was provided; derive test cases from the code alone.";

const ENGINEER: &str = "You are a professional software engineer.";
const TESTER: &str = "You are a professional software tester.";

fn with_custom(mut prompt: String, custom_instructions: Option<&str>) -> String {
    if let Some(custom) = custom_instructions {
        prompt.push_str(&format!("\n\n## Additional Instructions\n\n{}\n", custom));
    }
    prompt
}

fn schema(name: &str, schema: Value) -> ResponseSchema {
    ResponseSchema {
        name: name.to_string(),
        schema,
    }
}

// ============================================================================
// Stage 1: languages and frameworks
// ============================================================================

pub fn stack_request(chunk: &str, custom_instructions: Option<&str>) -> CompletionRequest {
    let prompt = format!(
        r#"Given this content of code from a repository, {marker} it uses.

Content:
{chunk}

Requirements:
- List every programming language that appears in the code (e.g. "Python", "JavaScript").
- List every framework the code is built on (e.g. "Django", "Flask", "Express"); use an empty list when there is none.
- Do not list libraries that are only used by tests or tooling.
- Do not return any explanation or comments along with the result.

Return the result in the following JSON format:
{{
    "languages": ["<language>", ...],
    "frameworks": ["<framework>", ...]
}}"#,
        marker = STACK_MARKER,
        chunk = chunk.trim(),
    );

    CompletionRequest::new(vec![
        ChatMessage::system(ENGINEER),
        ChatMessage::user(with_custom(prompt, custom_instructions)),
    ])
    .with_schema(stack_schema())
}

pub fn stack_schema() -> ResponseSchema {
    schema(
        "TechStack",
        json!({
            "type": "object",
            "properties": {
                "languages": {"type": "array", "items": {"type": "string"}},
                "frameworks": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["languages", "frameworks"]
        }),
    )
}

// ============================================================================
// Stage 2: testable units
// ============================================================================

pub fn units_request(chunk: &str, custom_instructions: Option<&str>) -> CompletionRequest {
    let prompt = format!(
        r#"Given this content of code: {chunk} of this project, analyze the code to {marker}.

Requirements:
- Identify only user-defined functions or classes explicitly defined in the provided code.
- Exclude built-in functions, classes or methods of the language, standard library elements and framework-provided constructs.
- For each identified function or class:
  - Provide an identifier in the format "id": "<id>".
  - Include the path of the file that defines it, relative to the repository root.
  - Provide the name and type ("function" or "class").
  - Include the complete code snippet defining the function or class.
- Do not return any explanation or comments along with the list.

Return the result in the following JSON format:
{{
    "snippets": [
        {{
            "id": "<id>",
            "path": "<path of the file>",
            "name": "<function_or_class>",
            "type": "<function|class>",
            "code": "<full_code_snippet>"
        }}
    ]
}}"#,
        chunk = chunk.trim(),
        marker = UNITS_MARKER,
    );

    CompletionRequest::new(vec![
        ChatMessage::system(ENGINEER),
        ChatMessage::user(with_custom(prompt, custom_instructions)),
    ])
    .with_schema(units_schema())
}

pub fn units_schema() -> ResponseSchema {
    schema(
        "CodeSnippetList",
        json!({
            "type": "object",
            "properties": {
                "snippets": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "path": {"type": "string"},
                            "name": {"type": "string"},
                            "type": {"type": "string"},
                            "code": {"type": "string"}
                        },
                        "required": ["path", "name", "type", "code"]
                    }
                }
            },
            "required": ["snippets"]
        }),
    )
}

// ============================================================================
// Stage 3: test cases
// ============================================================================

pub fn cases_request(
    stack: &TechStack,
    unit: &TestableUnit,
    code_chunk: &str,
    requirements_chunk: &str,
    custom_instructions: Option<&str>,
) -> CompletionRequest {
    let prompt = format!(
        r#"Given the following code written in {language}:

Function or class: {name} ({kind})
Path: {path}

Analyze the provided code and perform the following tasks:
1. For all the identified functions and classes in the code that require unit testing:
{code}
2. Compare the identified functions and classes against the provided requirements text:
{requirements}
3. {marker}, specific to how these functions and classes fulfill or interact with the requirements, and categorize each into one of these categories and subcategories:

    - Edge Cases: extreme or boundary conditions.
        - Boundary value analysis
        - Extreme input scenarios
        - Stress testing with unusual inputs
    - Functional Cases: the functional requirements of the system.
        - Core functionality
        - Input validation
        - Output verification

4. For each test case provide:
    - test_case_id: an identifier for the test case.
    - category: "<category> > <subcategory>", e.g. "Edge Cases > Boundary value analysis".
    - test_name: a short descriptive name, e.g. "test_add_positive_numbers".
    - description: the purpose of the test case.
    - test_data: the input data.
    - expected_output: the expected outcome.
    - is_regression: whether this is a regression test.
5. function_path is "{path}"; it is used to build the import statement in the test code.
Do not return any explanation or comments along with the list.

Return the result in the following JSON format:
{{
    "test_cases_result": [
        {{
            "function": "{name}",
            "function_id": "<id>",
            "function_path": "{path}",
            "test_cases": [
                {{
                    "test_case_id": "<id>",
                    "category": "<category> > <subcategory>",
                    "test_name": "<test_name>",
                    "description": "<description>",
                    "test_data": <test_data>,
                    "expected_output": <expected_output>,
                    "is_regression": <true|false>
                }}
            ]
        }}
    ]
}}"#,
        language = stack.languages_label(),
        name = unit.name,
        kind = match unit.kind {
            UnitKind::Class => "class",
            UnitKind::Function => "function",
        },
        path = unit.path,
        code = code_chunk.trim(),
        requirements = requirements_chunk.trim(),
        marker = CASES_MARKER,
    );

    CompletionRequest::new(vec![
        ChatMessage::system(TESTER),
        ChatMessage::user(with_custom(prompt, custom_instructions)),
    ])
    .with_schema(cases_schema())
}

pub fn cases_schema() -> ResponseSchema {
    schema(
        "FunctionTestList",
        json!({
            "type": "object",
            "properties": {
                "test_cases_result": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "function": {"type": "string"},
                            "function_id": {"type": "string"},
                            "function_path": {"type": "string"},
                            "test_cases": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "test_case_id": {"type": "string"},
                                        "category": {"type": "string"},
                                        "test_name": {"type": "string"},
                                        "description": {"type": "string"},
                                        "test_data": {},
                                        "expected_output": {},
                                        "is_regression": {"type": "boolean"}
                                    },
                                    "required": ["category", "test_name", "description"]
                                }
                            }
                        },
                        "required": ["test_cases"]
                    }
                }
            },
            "required": ["test_cases_result"]
        }),
    )
}

// ============================================================================
// Stage 4: test code
// ============================================================================

/// Inputs Stage 4 needs beyond the test cases themselves.
#[derive(Debug, Clone, Copy)]
pub struct CodeContext<'a> {
    pub stack: &'a TechStack,
    pub tree: Option<&'a str>,
    pub repo_name: Option<&'a str>,
}

pub fn code_request(
    ctx: CodeContext<'_>,
    unit: &TestableUnit,
    cases_chunk: &str,
    custom_instructions: Option<&str>,
) -> CompletionRequest {
    let language = ctx.stack.languages_label();
    let framework = ctx.stack.frameworks_label();

    let django_rules = if ctx.stack.is_django() {
        let location = match ctx.tree.and_then(|t| project_root::find_in_tree(t, "manage.py")) {
            Some(dir) if dir.is_empty() => "the repository root, so project_root_path is \"\"".to_string(),
            Some(dir) => format!("\"{}\"", dir),
            None => "unknown, so project_root_path is null".to_string(),
        };
        format!(
            r#"
Because the framework is Django:
1. Test only models and fields that exist in the provided code; never reference models or fields that do not exist.
2. Use Django's ORM for CRUD operations (`Model.objects.create(...)`, `Model.objects.all()`).
3. Use Django's assertion methods (`self.assertEqual`, `self.assertTrue`, `self.assertRaises`).
4. Test only views that exist, through Django's test client with literal paths; do not use `reverse`.
5. project_root_path is the directory containing manage.py, relative to the repository{repo}: {location}.
   Make sure project_root_path does not start with "/".
"#,
            location = location,
            repo = ctx
                .repo_name
                .map(|r| format!(" \"{}\"", r))
                .unwrap_or_default(),
        )
    } else {
        "\nproject_root_path must be null.\n".to_string()
    };

    let prompt = format!(
        r#"Given the following function in {language}:

Function Name: {name}
Function Path: {path}

Test Cases:
{cases}

Requirements:
- {marker} based on the provided test cases.
- Use the testing library suited to the framework "{framework}", or to the language "{language}" when there is no framework: unittest for Django, pytest for Python, Jest for JavaScript or Node.js.
- Do not use any other testing library.
- Import the function from its real location: `{path}`.
- Cover every provided test case, including its description and expected output, with assertions.
- Provide the name of the test file and the testing library used.
- The code must be complete and runnable; do not include irrelevant code.
- Do not return any explanation or comments along with the list.
{django_rules}
Return the result in the following JSON format:
{{
    "test_code_result": [
        {{
            "unit_test_code": "<unit_test_code>",
            "test_library": "<test_library>",
            "name_unit_test_file": "<name_of_test_file>",
            "path": "<path_of_test_file>",
            "category": "<category>",
            "project_root_path": "<project_root_path or null>"
        }}
    ]
}}"#,
        language = language,
        framework = framework,
        name = unit.name,
        path = unit.path,
        cases = cases_chunk.trim(),
        marker = CODE_MARKER,
        django_rules = django_rules,
    );

    CompletionRequest::new(vec![
        ChatMessage::system(TESTER),
        ChatMessage::user(with_custom(prompt, custom_instructions)),
    ])
    .with_schema(code_schema())
}

pub fn code_schema() -> ResponseSchema {
    schema(
        "UnitTestList",
        json!({
            "type": "object",
            "properties": {
                "test_code_result": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "unit_test_code": {"type": "string"},
                            "test_library": {"type": "string"},
                            "name_unit_test_file": {"type": "string"},
                            "path": {"type": "string"},
                            "category": {"type": "string"},
                            "project_root_path": {"type": ["string", "null"]}
                        },
                        "required": ["unit_test_code", "test_library", "name_unit_test_file"]
                    }
                }
            },
            "required": ["test_code_result"]
        }),
    )
}
