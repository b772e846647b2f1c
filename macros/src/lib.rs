//! Augment the development of simulations with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, Error, ItemFn, LitStr};

/// Run a test function with a [tracing] subscriber that writes to the test output.
///
/// The optional argument sets the maximum level (`"TRACE"`, `"DEBUG"`, `"INFO"`, `"WARN"`
/// or `"ERROR"`) and defaults to `"DEBUG"`. Crates using this macro must depend on
/// `tracing` and `tracing-subscriber` (with the `fmt` feature).
///
/// # Example
///
/// ```rust,ignore
/// use tempo_macros::test_traced;
///
/// #[test_traced("INFO")]
/// fn test_info_level() {
///     tracing::info!("captured by the test writer");
///     assert_eq!(2 + 2, 4);
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    // Parse the requested level
    let (level, span) = if attr.is_empty() {
        ("DEBUG".to_string(), Span::call_site())
    } else {
        let literal = parse_macro_input!(attr as LitStr);
        (literal.value().to_uppercase(), literal.span())
    };
    let level = match level.as_str() {
        "TRACE" => quote!(::tracing::Level::TRACE),
        "DEBUG" => quote!(::tracing::Level::DEBUG),
        "INFO" => quote!(::tracing::Level::INFO),
        "WARN" => quote!(::tracing::Level::WARN),
        "ERROR" => quote!(::tracing::Level::ERROR),
        other => {
            return Error::new(span, format!("unknown tracing level: {other}"))
                .to_compile_error()
                .into()
        }
    };

    // Wrap the body with a scoped subscriber
    let name = &input.sig.ident;
    let attrs = &input.attrs;
    let vis = &input.vis;
    let output = &input.sig.output;
    let block = &input.block;
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis fn #name() #output {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(#level)
                .with_line_number(true)
                .finish();
            let dispatcher = ::tracing::Dispatch::new(subscriber);
            ::tracing::dispatcher::with_default(&dispatcher, || #block)
        }
    };
    expanded.into()
}
