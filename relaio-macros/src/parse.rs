use proc_macro2::{Span, TokenStream};
use syn::Attribute;

pub(crate) fn parse_string(lit: &syn::Lit, span: Span, field: &str) -> Result<String, syn::Error> {
    match lit {
        syn::Lit::Str(s) => Ok(s.value()),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as string."),
        )),
    }
}

pub(crate) fn parse_int(lit: &syn::Lit, span: Span, field: &str) -> Result<usize, syn::Error> {
    match lit {
        syn::Lit::Int(lit) => lit.base10_parse::<usize>().map_err(|e| {
            syn::Error::new(
                span,
                format!("Failed to parse value of `{field}` as integer: {e}"),
            )
        }),
        _ => Err(syn::Error::new(
            span,
            format!("Failed to parse value of `{field}` as integer."),
        )),
    }
}

/// Matches `#[test]`, `#[core::prelude::*::test]` and
/// `#[std::prelude::*::test]`.
pub(crate) fn is_test_attribute(attr: &Attribute) -> bool {
    let syn::Meta::Path(path) = &attr.meta else {
        return false;
    };

    if path.leading_colon.is_none() && path.is_ident("test") {
        return true;
    }

    let segments: Vec<_> = path.segments.iter().collect();
    if segments.len() != 4 || segments.iter().any(|s| !s.arguments.is_none()) {
        return false;
    }
    ["core", "std"].contains(&segments[0].ident.to_string().as_str())
        && segments[1].ident == "prelude"
        && segments[3].ident == "test"
}

pub(crate) fn token_stream_with_error(mut tokens: TokenStream, error: syn::Error) -> TokenStream {
    tokens.extend(error.into_compile_error());
    tokens
}
