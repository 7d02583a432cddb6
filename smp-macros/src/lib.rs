//! Procedural macros for smp-rs.
//!
//! This crate provides the `#[smp_rs::test]` attribute macro for writing
//! tests that run against every compiled-in backend.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, FnArg, ItemFn, Meta};

/// Configuration parsed from the macro attributes.
#[derive(Default)]
struct TestConfig {
    threads: Option<usize>,
    backend: Option<syn::LitStr>,
}

impl TestConfig {
    fn parse(attrs: &[Meta]) -> syn::Result<Self> {
        let mut config = Self::default();

        for meta in attrs {
            let Meta::NameValue(nv) = meta else {
                return Err(syn::Error::new_spanned(
                    meta,
                    "expected `key = value` format",
                ));
            };
            let ident = nv
                .path
                .get_ident()
                .ok_or_else(|| syn::Error::new_spanned(&nv.path, "expected identifier"))?;

            match (ident.to_string().as_str(), &nv.value) {
                (
                    "threads",
                    syn::Expr::Lit(syn::ExprLit {
                        lit: syn::Lit::Int(lit),
                        ..
                    }),
                ) => config.threads = Some(lit.base10_parse::<usize>()?),
                (
                    "backend",
                    syn::Expr::Lit(syn::ExprLit {
                        lit: syn::Lit::Str(lit),
                        ..
                    }),
                ) => config.backend = Some(lit.clone()),
                ("threads", value) => {
                    return Err(syn::Error::new_spanned(value, "expected integer literal"))
                }
                ("backend", value) => {
                    return Err(syn::Error::new_spanned(value, "expected string literal"))
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        ident,
                        format!("unknown attribute `{ident}`, expected `threads` or `backend`"),
                    ))
                }
            }
        }

        Ok(config)
    }
}

/// A test attribute macro that runs the test body once per backend.
///
/// The annotated function takes the runtime under test as its only
/// parameter. Each run gets a fresh runtime named after the test.
///
/// # Default Configuration
///
/// - Every compiled-in backend, in turn
/// - 4 worker threads
/// - Thread pinning disabled
///
/// # Attributes
///
/// - `threads = N` - Set the worker count
/// - `backend = "name"` - Run on the named backend only
///
/// # Examples
///
/// ```ignore
/// #[smp_rs::test]
/// fn test_sum(rt: &smp_rs::SmpRuntime) {
///     let mut values = vec![1_i64; 100];
///     rt.fill(&mut values, 2).unwrap();
///     assert_eq!(values.iter().sum::<i64>(), 200);
/// }
///
/// #[smp_rs::test(threads = 2, backend = "stealing")]
/// fn test_sort(rt: &smp_rs::SmpRuntime) {
///     // Test code here
/// }
/// ```
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let attr_parser = syn::punctuated::Punctuated::<Meta, syn::Token![,]>::parse_terminated;
    let attrs = match syn::parse::Parser::parse(attr_parser, attr) {
        Ok(attrs) => attrs,
        Err(e) => return e.to_compile_error().into(),
    };

    let config = match TestConfig::parse(&attrs.into_iter().collect::<Vec<_>>()) {
        Ok(c) => c,
        Err(e) => return e.to_compile_error().into(),
    };

    match generate_test(input, config) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn generate_test(input: ItemFn, config: TestConfig) -> syn::Result<TokenStream2> {
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;

    if let Some(asyncness) = sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "test function must not be async",
        ));
    }
    if sig.inputs.len() != 1 || !matches!(sig.inputs.first(), Some(FnArg::Typed(_))) {
        return Err(syn::Error::new_spanned(
            &sig.inputs,
            "test function must take the runtime as its only parameter, e.g. `rt: &SmpRuntime`",
        ));
    }

    let fn_name = &sig.ident;
    let threads = config.threads.unwrap_or(4);

    let mut body_sig = sig.clone();
    body_sig.ident = format_ident!("__smp_test_body");

    let backends = match config.backend {
        Some(name) => quote! {
            ::std::iter::once(
                #name
                    .parse::<::smp_rs::BackendKind>()
                    .expect("unknown backend in #[smp_rs::test]"),
            )
            .filter(|kind| kind.is_compiled())
        },
        None => quote! { ::smp_rs::BackendKind::compiled() },
    };

    let mut outer_sig = sig.clone();
    outer_sig.inputs.clear();

    let output = quote! {
        #[::core::prelude::v1::test]
        #(#attrs)*
        #vis #outer_sig {
            #body_sig #block

            for __smp_backend in #backends {
                let __smp_runtime = ::smp_rs::SmpBuilder::new()
                    .prefix(concat!("test-", stringify!(#fn_name)))
                    .backend(__smp_backend)
                    .num_threads(#threads)
                    .pin_threads(false)
                    .build()
                    .expect("failed to create test runtime");

                __smp_test_body(&__smp_runtime);
            }
        }
    };

    Ok(output)
}
