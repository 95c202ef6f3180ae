use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Html,
    Css,
    Js,
    Python,
    Txt,
    Json,
    Md,
}

impl DocType {
    /// Type from the filename extension; unknown extensions are plain text.
    pub fn from_filename(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "html" | "htm" => DocType::Html,
            "css" => DocType::Css,
            "js" => DocType::Js,
            "py" => DocType::Python,
            "json" => DocType::Json,
            "md" => DocType::Md,
            _ => DocType::Txt,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Html => "html",
            DocType::Css => "css",
            DocType::Js => "js",
            DocType::Python => "python",
            DocType::Txt => "txt",
            DocType::Json => "json",
            DocType::Md => "md",
        }
    }

    /// Starter content for a freshly created document.
    pub fn template(&self) -> &'static str {
        match self {
            DocType::Html => "<!DOCTYPE html>\n<html>\n<head>\n    <title>New Page</title>\n</head>\n<body>\n    <h1>Hello World</h1>\n</body>\n</html>",
            DocType::Css => "/* Add your styles here */\nbody {\n    font-family: Arial, sans-serif;\n    margin: 0;\n    padding: 20px;\n}",
            DocType::Js => "// Add your JavaScript here\nconsole.log(\"Hello from JavaScript!\");",
            DocType::Python => "# Add your Python code here\nprint(\"Hello from Python!\")",
            DocType::Txt => "",
            DocType::Json => "{\n    \"name\": \"example\",\n    \"value\": \"data\"\n}",
            DocType::Md => "# New Document\n\nWrite your markdown here...",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub doc_type: DocType,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            doc_type: DocType::from_filename(&name),
            name,
            content: content.into(),
        }
    }
}
