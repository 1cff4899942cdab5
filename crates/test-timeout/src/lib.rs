//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[test_timeout::timeout]` wraps a synchronous test and
//! `#[test_timeout::tokio_timeout_test]` wraps an async one in a fresh
//! current-thread runtime. Both take an optional limit in seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_LIMIT_SECS: u64 = 60;

fn limit_secs(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_LIMIT_SECS);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be at least one second"));
    }
    Ok(secs)
}

fn path_is(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}

/// Run `body` on a helper thread and panic if it outlives `secs`. Panics from
/// the body are re-raised on the test thread.
fn watchdog(secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __limit = ::std::time::Duration::from_secs(#secs);
        let (__done_tx, __done_rx) = ::std::sync::mpsc::channel();
        ::std::thread::spawn(move || {
            let __outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| { #body }));
            let _ = __done_tx.send(__outcome);
        });
        match __done_rx.recv_timeout(__limit) {
            Ok(Ok(())) => {}
            Ok(Err(panic)) => ::std::panic::resume_unwind(panic),
            Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {}s limit", #secs)
            }
            Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting")
            }
        }
    }
}

fn expand(attr: TokenStream, item: TokenStream, is_async: bool) -> TokenStream {
    let secs = match limit_secs(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() != is_async {
        let message = if is_async {
            "tokio_timeout_test needs an async fn"
        } else {
            "timeout needs a plain fn; use tokio_timeout_test for async tests"
        };
        return syn::Error::new_spanned(&sig.ident, message)
            .to_compile_error()
            .into();
    }
    sig.asyncness = None;

    // The generated `#[test]` replaces whichever test attribute was written.
    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !path_is(attr, &["test"]) && !path_is(attr, &["tokio", "test"]))
        .collect();

    let body = if is_async {
        quote! {
            let __runtime = ::tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("test runtime");
            __runtime.block_on(async move {
                if ::tokio::time::timeout(__limit, async move #block).await.is_err() {
                    panic!("test exceeded its {}s limit", #secs);
                }
            });
        }
    } else {
        quote! { #block }
    };
    let guarded = watchdog(secs, body);

    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    }
    .into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, false)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, item, true)
}
