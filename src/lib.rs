pub mod api;
pub mod ast;
pub mod builder;
pub mod convert;
pub mod cst;
pub mod diag;
pub mod eval;
pub mod format;
pub mod json;
pub mod number;
pub mod parser;
pub mod pos;
pub mod printer;
pub mod scanner;
pub mod schema;
pub mod token;
pub mod value;
pub mod walk;

pub use api::{
    eval, format, parse_config, parse_expression, parse_json, parse_template,
    parse_traversal_abs, File,
};
