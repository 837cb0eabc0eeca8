use proc_macro::TokenStream;
use quote::quote;
use syn::Lit;

/// Environment variable that overrides the iteration count of every `#[n_times]` test, so that
/// CI can crank fuzzing up (or a local run can turn it down to 1).
const ITERATIONS_ENV: &str = "FANOUT_N_TIMES";

/// Proc macro that runs a test body N times.
///
/// The loop index is available in the body as `__n_times_iteration`.
#[proc_macro_attribute]
pub fn n_times(args: TokenStream, item: TokenStream) -> TokenStream {
    let fun = syn::parse_macro_input!(item as syn::ItemFn);

    let n = syn::parse_macro_input!(args as Lit);
    let n: usize = match n {
        Lit::Int(n) => match n.base10_parse() {
            Ok(n) => n,
            Err(e) => return e.to_compile_error().into(),
        },
        other => {
            return syn::Error::new_spanned(other, "n_times expects an integer literal")
                .to_compile_error()
                .into()
        }
    };

    let name = fun.sig.ident.clone();
    let args = fun.sig.inputs.clone();
    let body = fun.block.clone();
    let visibility = &fun.vis;
    let attributes = fun.attrs;

    let new_fn = quote! {
        #(#attributes)*
        #visibility fn #name(#args) {
            let iterations: usize = ::std::env::var(#ITERATIONS_ENV)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(#n);
            for __n_times_iteration in 0..iterations {
                let _ = __n_times_iteration;
                #body
            }
        }
    };

    new_fn.into()
}
